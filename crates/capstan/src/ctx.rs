//! Per-invocation context: argv/environ, standard streams, the fd table,
//! clocks, randomness, and the abort token.

use crate::clocks::WasiClocks;
use crate::error::Error;
use crate::fs::DirHandle;
use crate::random::random_ctx;
use crate::stream::{InputStream, NullStream, OutputStream};
use crate::table::{FdTable, Preopen};
use capstan_layout::Layout;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// The shared layout behind both argv and environ: a packed NUL-terminated
/// buffer plus a parallel offsets array, written to the guest as absolute
/// pointers.
pub struct StringCollection {
    elements: Vec<String>,
}

impl StringCollection {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
        }
    }

    pub fn push(&mut self, s: &str) -> Result<(), Error> {
        if s.as_bytes().contains(&0) {
            return Err(Error::invalid_argument().context("strings may not contain NUL"));
        }
        self.elements.push(s.to_owned());
        Ok(())
    }

    pub fn number_elements(&self) -> u32 {
        self.elements.len() as u32
    }

    /// Total buffer size including each element's NUL terminator.
    pub fn cumulative_size(&self) -> u32 {
        self.elements.iter().map(|e| e.len() as u32 + 1).sum()
    }

    /// Write the offsets array at `offsets_ptr` (absolute pointers into the
    /// buffer) and the packed NUL-separated buffer at `buf_ptr`.
    pub fn write_to_guest(
        &self,
        mem: &mut [u8],
        offsets_ptr: u32,
        buf_ptr: u32,
    ) -> Result<(), Error> {
        let mut offset = offsets_ptr;
        let mut cursor = buf_ptr;
        for element in &self.elements {
            cursor.set(mem, offset)?;
            capstan_layout::write_bytes(mem, cursor, element.as_bytes())?;
            0u8.set(mem, cursor + element.len() as u32)?;
            offset += 4;
            cursor += element.len() as u32 + 1;
        }
        Ok(())
    }
}

impl Default for StringCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct AbortInner {
    fired: AtomicBool,
    notify: Notify,
}

/// A cloneable cancellation signal, consulted by every WASI call and raced
/// against host awaits. Firing turns in-flight and subsequent calls into
/// `CANCELED`.
#[derive(Clone, Default)]
pub struct AbortToken {
    inner: Arc<AbortInner>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::canceled().context("invocation aborted"))
        } else {
            Ok(())
        }
    }

    /// Resolve once the token fires.
    pub async fn cancelled(&self) {
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        loop {
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

pub struct WasiCtx {
    pub(crate) args: StringCollection,
    pub(crate) env: StringCollection,
    pub(crate) stdin: Arc<dyn InputStream>,
    pub(crate) stdout: Arc<dyn OutputStream>,
    pub(crate) stderr: Arc<dyn OutputStream>,
    pub(crate) table: FdTable,
    pub(crate) clocks: WasiClocks,
    pub(crate) random: Mutex<Box<dyn RngCore + Send>>,
    pub(crate) abort: AbortToken,
}

impl WasiCtx {
    pub fn builder() -> WasiCtxBuilder {
        WasiCtxBuilder::default()
    }

    pub fn table(&self) -> &FdTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut FdTable {
        &mut self.table
    }

    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }
}

#[derive(Default)]
pub struct WasiCtxBuilder {
    args: StringCollection,
    env: StringCollection,
    preopens: Vec<Preopen>,
    stdin: Option<Arc<dyn InputStream>>,
    stdout: Option<Arc<dyn OutputStream>>,
    stderr: Option<Arc<dyn OutputStream>>,
    random: Option<Box<dyn RngCore + Send>>,
    abort: Option<AbortToken>,
}

impl WasiCtxBuilder {
    pub fn arg(mut self, arg: impl AsRef<str>) -> Result<Self, Error> {
        self.args.push(arg.as_ref())?;
        Ok(self)
    }

    pub fn args(mut self, args: &[impl AsRef<str>]) -> Result<Self, Error> {
        for a in args {
            self.args.push(a.as_ref())?;
        }
        Ok(self)
    }

    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self, Error> {
        self.env
            .push(&format!("{}={}", key.as_ref(), value.as_ref()))?;
        Ok(self)
    }

    pub fn preopened_dir(mut self, guest_path: impl AsRef<str>, dir: Arc<dyn DirHandle>) -> Self {
        self.preopens.push(Preopen {
            guest_path: guest_path.as_ref().to_owned(),
            dir,
        });
        self
    }

    pub fn stdin(mut self, stdin: impl InputStream + 'static) -> Self {
        self.stdin = Some(Arc::new(stdin));
        self
    }

    pub fn stdout(mut self, stdout: impl OutputStream + 'static) -> Self {
        self.stdout = Some(Arc::new(stdout));
        self
    }

    pub fn stderr(mut self, stderr: impl OutputStream + 'static) -> Self {
        self.stderr = Some(Arc::new(stderr));
        self
    }

    pub fn random(mut self, random: Box<dyn RngCore + Send>) -> Self {
        self.random = Some(random);
        self
    }

    pub fn abort(mut self, token: AbortToken) -> Self {
        self.abort = Some(token);
        self
    }

    pub fn build(self) -> WasiCtx {
        WasiCtx {
            args: self.args,
            env: self.env,
            stdin: self.stdin.unwrap_or_else(|| Arc::new(NullStream)),
            stdout: self.stdout.unwrap_or_else(|| Arc::new(NullStream)),
            stderr: self.stderr.unwrap_or_else(|| Arc::new(NullStream)),
            table: FdTable::new(self.preopens),
            clocks: WasiClocks::new(),
            random: Mutex::new(self.random.unwrap_or_else(random_ctx)),
            abort: self.abort.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_collection_layout() {
        let mut args = StringCollection::new();
        args.push("prog").unwrap();
        args.push("-x").unwrap();
        assert_eq!(args.number_elements(), 2);
        assert_eq!(args.cumulative_size(), 8);

        let mut mem = vec![0u8; 64];
        args.write_to_guest(&mut mem, 0, 16).unwrap();
        // absolute pointers
        assert_eq!(u32::get(&mem, 0).unwrap(), 16);
        assert_eq!(u32::get(&mem, 4).unwrap(), 21);
        assert_eq!(&mem[16..24], b"prog\0-x\0");
    }

    #[test]
    fn rejects_interior_nul() {
        let mut args = StringCollection::new();
        assert!(args.push("a\0b").is_err());
    }

    #[tokio::test]
    async fn abort_token_wakes_waiters() {
        let token = AbortToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        waiter.await.unwrap();
        assert!(token.check().is_err());
    }
}
