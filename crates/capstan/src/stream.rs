//! Standard-stream plumbing.
//!
//! These types mimic Unix pipes for the three reserved descriptors, so that
//! guest stdio can be redirected to buffers, callbacks, or nothing at all.
//! All of them are cheaply cloneable handles onto shared state, in the
//! spirit of the usual virtual-pipe types.

use crate::error::Error;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

#[async_trait::async_trait]
pub trait InputStream: Send + Sync {
    /// Read up to `len` bytes; an empty result is end of stream.
    async fn read(&self, len: usize) -> Result<Bytes, Error>;
}

#[async_trait::async_trait]
pub trait OutputStream: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), Error>;
}

/// Reads nothing, discards everything. The default stdio wiring.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStream;

#[async_trait::async_trait]
impl InputStream for NullStream {
    async fn read(&self, _len: usize) -> Result<Bytes, Error> {
        Ok(Bytes::new())
    }
}

#[async_trait::async_trait]
impl OutputStream for NullStream {
    async fn write(&self, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// Stdin served from a preloaded buffer.
#[derive(Clone, Debug)]
pub struct BufferIn {
    inner: Arc<Mutex<Bytes>>,
}

impl BufferIn {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data.into())),
        }
    }
}

#[async_trait::async_trait]
impl InputStream for BufferIn {
    async fn read(&self, len: usize) -> Result<Bytes, Error> {
        let mut remaining = self.inner.lock().unwrap();
        let take = len.min(remaining.len());
        Ok(remaining.split_to(take))
    }
}

/// An in-memory capture of everything the guest wrote.
#[derive(Clone, Debug, Default)]
pub struct BufferOut {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl BufferOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().unwrap().clone()
    }

    /// Recover the buffer, failing with `Err(self)` while other handles
    /// remain.
    pub fn try_into_inner(mut self) -> Result<Vec<u8>, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(m) => Ok(m.into_inner().unwrap()),
            Err(inner) => {
                self.inner = inner;
                Err(self)
            }
        }
    }
}

#[async_trait::async_trait]
impl OutputStream for BufferOut {
    async fn write(&self, data: &[u8]) -> Result<(), Error> {
        self.inner.lock().unwrap().extend_from_slice(data);
        Ok(())
    }
}

/// Streaming UTF-8 decode into a callback; bytes split across writes are
/// carried until the sequence completes.
pub struct StringOut {
    callback: Box<dyn Fn(&str) + Send + Sync>,
    partial: Mutex<Vec<u8>>,
}

impl StringOut {
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            partial: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl OutputStream for StringOut {
    async fn write(&self, data: &[u8]) -> Result<(), Error> {
        let mut partial = self.partial.lock().unwrap();
        partial.extend_from_slice(data);
        let valid_up_to = match std::str::from_utf8(&partial) {
            Ok(_) => partial.len(),
            Err(e) => e.valid_up_to(),
        };
        if valid_up_to > 0 {
            let chunk = std::str::from_utf8(&partial[..valid_up_to]).unwrap();
            (self.callback)(chunk);
            partial.drain(..valid_up_to);
        }
        Ok(())
    }
}

/// Line-oriented output: the callback sees whole lines without their
/// terminating `\n`; a trailing partial line is carried across writes.
pub struct LineOut {
    callback: Box<dyn Fn(&str) + Send + Sync>,
    partial: Mutex<String>,
}

impl LineOut {
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            partial: Mutex::new(String::new()),
        }
    }
}

#[async_trait::async_trait]
impl OutputStream for LineOut {
    async fn write(&self, data: &[u8]) -> Result<(), Error> {
        let mut partial = self.partial.lock().unwrap();
        partial.push_str(&String::from_utf8_lossy(data));
        while let Some(newline) = partial.find('\n') {
            let line: String = partial.drain(..=newline).collect();
            (self.callback)(line.trim_end_matches('\n'));
        }
        Ok(())
    }
}
