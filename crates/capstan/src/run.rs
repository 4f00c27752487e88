//! The invocation driver: assembles a context, instantiates the guest,
//! initialises the asyncify descriptor, and runs `_start` or arbitrary
//! exports through the controller.

use crate::asyncify::{self, Hooks, StoreState, DATA_ADDR, DATA_END, DATA_START};
use crate::ctx::WasiCtx;
use crate::error::I32Exit;
use anyhow::Context as _;
use capstan_layout::Layout;
use std::collections::HashMap;
use wasmtime::{Engine, Func, Instance, Linker, Module, Store, Val};

/// A single guest invocation under construction. Thin shell over
/// [`crate::WasiCtxBuilder`]: finish it with [`Runner::run`] for the
/// conventional `_start` entrypoint, or [`Runner::instantiate`] to call
/// exports by hand.
pub struct Runner {
    ctx: WasiCtx,
}

impl Runner {
    pub fn new(ctx: WasiCtx) -> Self {
        Self { ctx }
    }

    /// Compile `wasm` (binary or wat) and run its `_start`, returning the
    /// guest's exit status.
    pub async fn run(self, wasm: &[u8]) -> anyhow::Result<i32> {
        let engine = Engine::default();
        let module = Module::new(&engine, wasm).context("compiling guest module")?;
        self.run_module(&engine, &module).await
    }

    pub async fn run_module(self, engine: &Engine, module: &Module) -> anyhow::Result<i32> {
        let mut guest = self.instantiate_module(engine, module).await?;
        match guest.invoke("_start", &[]).await {
            Ok(_) => Ok(0),
            Err(err) => match err.downcast_ref::<I32Exit>() {
                Some(I32Exit(code)) => Ok(*code),
                None => Err(err),
            },
        }
    }

    /// Export mode: instantiate without running anything.
    pub async fn instantiate(self, wasm: &[u8]) -> anyhow::Result<GuestInstance> {
        let engine = Engine::default();
        let module = Module::new(&engine, wasm).context("compiling guest module")?;
        self.instantiate_module(&engine, &module).await
    }

    pub async fn instantiate_module(
        self,
        engine: &Engine,
        module: &Module,
    ) -> anyhow::Result<GuestInstance> {
        let mut linker = Linker::new(engine);
        crate::preview1::add_to_linker(&mut linker)?;

        let mut store = Store::new(engine, StoreState::new(self.ctx));
        let instance = linker
            .instantiate(&mut store, module)
            .context("instantiating guest")?;

        let hooks = Hooks::from_instance(&mut store, &instance)?;
        store.data_mut().hooks = Some(hooks);

        // Write the asyncify stack descriptor: the save region sits right
        // behind it, up to the conventional 1KiB boundary.
        let memory = instance
            .get_memory(&mut store, "memory")
            .context("guest does not export `memory`")?;
        let data = memory.data_mut(&mut store);
        DATA_START.set(data, DATA_ADDR).context("asyncify descriptor")?;
        DATA_END.set(data, DATA_ADDR + 4).context("asyncify descriptor")?;

        Ok(GuestInstance {
            store,
            instance,
            exports: HashMap::new(),
        })
    }
}

/// An instantiated guest. Every call goes through the asyncify controller,
/// so exports may transparently suspend on host I/O.
pub struct GuestInstance {
    store: Store<StoreState>,
    instance: Instance,
    exports: HashMap<String, Func>,
}

impl GuestInstance {
    /// Call the named export. The per-export handle is memoised, so
    /// repeated invocations reuse the same wrapped function.
    pub async fn invoke(&mut self, name: &str, params: &[Val]) -> anyhow::Result<Vec<Val>> {
        let func = match self.exports.get(name) {
            Some(func) => *func,
            None => {
                let func = self
                    .instance
                    .get_func(&mut self.store, name)
                    .with_context(|| format!("guest does not export `{name}`"))?;
                self.exports.insert(name.to_owned(), func);
                func
            }
        };
        asyncify::drive(&mut self.store, func, params).await
    }

    pub fn wasi(&mut self) -> &mut WasiCtx {
        &mut self.store.data_mut().wasi
    }
}
