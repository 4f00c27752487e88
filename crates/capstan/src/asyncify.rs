//! The asyncify controller: suspend/resume machinery that turns blocking
//! WASI calls into cooperative await points.
//!
//! The guest is a binaryen-asyncified module. When a binding cannot
//! complete immediately, the import stashes its in-flight future and starts
//! an unwind; the guest saves its own call stack into a buffer inside
//! linear memory and returns all the way out of the export. [`drive`] then
//! awaits the stashed future, starts a rewind, and re-enters the export;
//! the guest replays down to the suspended import, which hands it the
//! resolved value.

use crate::ctx::WasiCtx;
use crate::error::Error;
use anyhow::{bail, Context as _};
use std::future::Future;
use std::pin::Pin;
use wasmtime::{AsContextMut, Caller, Func, Instance, Store, TypedFunc, Val, ValType};

/// Address of the asyncify stack descriptor: two little-endian u32 words,
/// `(stack_begin, stack_end)`.
pub const DATA_ADDR: u32 = 16;
/// Default asyncify stack region within linear memory.
pub const DATA_START: u32 = DATA_ADDR + 8;
pub const DATA_END: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AsyncifyState {
    Normal,
    Unwinding,
    Rewinding,
}

impl AsyncifyState {
    fn from_raw(raw: i32) -> anyhow::Result<Self> {
        match raw {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Unwinding),
            2 => Ok(Self::Rewinding),
            other => bail!("guest reported unknown asyncify state {other}"),
        }
    }
}

/// Applies a resolved operation's outputs to guest memory at rewind time.
pub(crate) type ResumeFn = Box<dyn FnOnce(&mut WasiCtx, &mut [u8]) -> Result<(), Error> + Send>;

/// A suspended binding: owns everything it needs (`Arc` handles only, no
/// store borrows) and resolves to the closure that commits its effects.
pub(crate) struct PendingCall(
    pub Pin<Box<dyn Future<Output = Result<ResumeFn, Error>> + Send>>,
);

/// The single suspension slot. The guest is non-reentrant, so at most one
/// call is pending or resolved at a time.
#[derive(Default)]
pub(crate) struct Channel {
    pub pending: Option<PendingCall>,
    pub resolved: Option<Result<ResumeFn, Error>>,
}

/// Everything the host keeps in the wasmtime store.
pub struct StoreState {
    pub wasi: WasiCtx,
    pub(crate) channel: Channel,
    pub(crate) hooks: Option<Hooks>,
}

impl StoreState {
    pub fn new(wasi: WasiCtx) -> Self {
        Self {
            wasi,
            channel: Channel::default(),
            hooks: None,
        }
    }
}

/// Memoised handles to the guest's asyncify exports.
#[derive(Clone)]
pub(crate) struct Hooks {
    get_state: TypedFunc<(), i32>,
    start_unwind: TypedFunc<i32, ()>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<i32, ()>,
    stop_rewind: TypedFunc<(), ()>,
}

impl Hooks {
    pub fn from_instance(
        store: &mut Store<StoreState>,
        instance: &Instance,
    ) -> anyhow::Result<Self> {
        let typed = |store: &mut Store<StoreState>, name: &str| {
            instance
                .get_func(&mut *store, name)
                .with_context(|| format!("guest does not export `{name}`"))
        };
        Ok(Self {
            get_state: typed(store, "asyncify_get_state")?.typed(&mut *store)?,
            start_unwind: typed(store, "asyncify_start_unwind")?.typed(&mut *store)?,
            stop_unwind: typed(store, "asyncify_stop_unwind")?.typed(&mut *store)?,
            start_rewind: typed(store, "asyncify_start_rewind")?.typed(&mut *store)?,
            stop_rewind: typed(store, "asyncify_stop_rewind")?.typed(&mut *store)?,
        })
    }

    pub fn from_caller(caller: &mut Caller<'_, StoreState>) -> anyhow::Result<Self> {
        let typed = |caller: &mut Caller<'_, StoreState>, name: &str| {
            let func = caller
                .get_export(name)
                .and_then(|e| e.into_func())
                .with_context(|| format!("guest does not export `{name}`"))?;
            anyhow::Ok(func)
        };
        let get_state = typed(caller, "asyncify_get_state")?.typed(&mut *caller)?;
        let start_unwind = typed(caller, "asyncify_start_unwind")?.typed(&mut *caller)?;
        let stop_unwind = typed(caller, "asyncify_stop_unwind")?.typed(&mut *caller)?;
        let start_rewind = typed(caller, "asyncify_start_rewind")?.typed(&mut *caller)?;
        let stop_rewind = typed(caller, "asyncify_stop_rewind")?.typed(&mut *caller)?;
        Ok(Self {
            get_state,
            start_unwind,
            stop_unwind,
            start_rewind,
            stop_rewind,
        })
    }

    pub fn state(&self, mut store: impl AsContextMut) -> anyhow::Result<AsyncifyState> {
        AsyncifyState::from_raw(self.get_state.call(&mut store, ())?)
    }

    pub fn start_unwind(&self, mut store: impl AsContextMut) -> anyhow::Result<()> {
        self.start_unwind.call(&mut store, DATA_ADDR as i32)?;
        Ok(())
    }

    pub fn stop_unwind(&self, mut store: impl AsContextMut) -> anyhow::Result<()> {
        self.stop_unwind.call(&mut store, ())?;
        Ok(())
    }

    pub fn start_rewind(&self, mut store: impl AsContextMut) -> anyhow::Result<()> {
        self.start_rewind.call(&mut store, DATA_ADDR as i32)?;
        Ok(())
    }

    pub fn stop_rewind(&self, mut store: impl AsContextMut) -> anyhow::Result<()> {
        self.stop_rewind.call(&mut store, ())?;
        Ok(())
    }
}

/// Fetch the memoised hooks, resolving them from the calling instance's
/// exports the first time.
pub(crate) fn hooks_for(caller: &mut Caller<'_, StoreState>) -> anyhow::Result<Hooks> {
    if let Some(hooks) = caller.data().hooks.clone() {
        return Ok(hooks);
    }
    let hooks = Hooks::from_caller(caller)?;
    caller.data_mut().hooks = Some(hooks.clone());
    Ok(hooks)
}

fn zeroed_params(func: &Func, store: &mut Store<StoreState>) -> anyhow::Result<Vec<Val>> {
    func.ty(&mut *store)
        .params()
        .map(|ty| match ty {
            ValType::I32 => Ok(Val::I32(0)),
            ValType::I64 => Ok(Val::I64(0)),
            ValType::F32 => Ok(Val::F32(0)),
            ValType::F64 => Ok(Val::F64(0)),
            other => bail!("cannot re-enter an export with a {other} parameter"),
        })
        .collect()
}

/// Invoke a guest export, looping through unwind/rewind until it genuinely
/// completes. This is the only place host-side awaiting happens; the abort
/// token resolves a pending suspension to `CANCELED`.
pub(crate) async fn drive(
    store: &mut Store<StoreState>,
    func: Func,
    params: &[Val],
) -> anyhow::Result<Vec<Val>> {
    let hooks = store
        .data()
        .hooks
        .clone()
        .context("asyncify hooks are initialised at instantiation")?;
    if hooks.state(&mut *store)? != AsyncifyState::Normal {
        bail!("guest entered with asyncify machinery mid-flight");
    }

    let mut results = vec![Val::I32(0); func.ty(&mut *store).results().len()];
    func.call(&mut *store, params, &mut results)?;

    loop {
        match hooks.state(&mut *store)? {
            AsyncifyState::Normal => break,
            AsyncifyState::Rewinding => bail!("export returned while still rewinding"),
            AsyncifyState::Unwinding => {}
        }
        hooks.stop_unwind(&mut *store)?;

        let pending = store
            .data_mut()
            .channel
            .pending
            .take()
            .context("guest unwound without a pending host operation")?;
        let abort = store.data().wasi.abort_token();
        tracing::trace!("guest suspended; awaiting host operation");
        let resolved = tokio::select! {
            biased;
            r = pending.0 => r,
            () = abort.cancelled() => {
                Err(Error::canceled().context("aborted while suspended"))
            }
        };
        tracing::trace!("host operation resolved; rewinding guest");

        if hooks.state(&mut *store)? != AsyncifyState::Normal {
            bail!("asyncify state changed while host was awaiting");
        }
        store.data_mut().channel.resolved = Some(resolved);
        hooks.start_rewind(&mut *store)?;

        // The original arguments live in the asyncified stack; passing them
        // again would corrupt the rewind. Zero-valued parameters satisfy
        // the signature and are ignored by the guest.
        let zeroed = zeroed_params(&func, store)?;
        func.call(&mut *store, &zeroed, &mut results)?;
    }

    if store.data().channel.pending.is_some() || store.data().channel.resolved.is_some() {
        bail!("suspension slot not consumed by the rewound import");
    }
    Ok(results)
}
