//! The backing state of a regular-file descriptor.

use crate::abi::Whence;
use crate::error::Error;
use crate::fs::{FileHandle, FileMeta};
use bytes::Bytes;
use std::sync::Arc;

/// A pending run of contiguous written bytes, not yet handed to the
/// provider.
#[derive(Debug)]
struct DirtyRun {
    start: u64,
    data: Vec<u8>,
}

impl DirtyRun {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

/// An open regular file: the provider handle, the seek position, and a
/// write-back buffer. Sequential writes accumulate in the buffer; anything
/// that observes file contents or size commits it first.
pub struct OpenFile {
    handle: Arc<dyn FileHandle>,
    position: u64,
    dirty: Option<DirtyRun>,
}

impl OpenFile {
    pub fn new(handle: Arc<dyn FileHandle>) -> Self {
        Self {
            handle,
            position: 0,
            dirty: None,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read up to `len` bytes at the current position, advancing it by the
    /// amount actually read.
    pub async fn read(&mut self, len: usize) -> Result<Bytes, Error> {
        self.commit().await?;
        let data = self.handle.read_at(self.position, len).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Buffer `data` at the current position. Contiguous with the pending
    /// run it extends it; otherwise the run is committed first.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        match &mut self.dirty {
            Some(run) if run.end() == self.position => run.data.extend_from_slice(data),
            _ => {
                self.commit().await?;
                self.dirty = Some(DirtyRun {
                    start: self.position,
                    data: data.to_vec(),
                });
            }
        }
        self.position += data.len() as u64;
        Ok(data.len())
    }

    pub async fn seek(&mut self, whence: Whence, offset: i64) -> Result<u64, Error> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position as i64,
            Whence::End => self.size().await? as i64,
        };
        let target = base
            .checked_add(offset)
            .ok_or_else(Error::invalid_argument)?;
        if target < 0 {
            return Err(Error::invalid_argument().context("seek before start of file"));
        }
        self.position = target as u64;
        Ok(self.position)
    }

    pub async fn meta(&mut self) -> Result<FileMeta, Error> {
        self.commit().await?;
        self.handle.meta().await
    }

    async fn size(&mut self) -> Result<u64, Error> {
        Ok(self.meta().await?.size)
    }

    pub async fn set_len(&mut self, size: u64) -> Result<(), Error> {
        self.commit().await?;
        self.handle.set_len(size).await
    }

    /// Hand the pending run to the provider. Idempotent.
    pub async fn commit(&mut self) -> Result<(), Error> {
        if let Some(run) = self.dirty.take() {
            self.handle.write_at(run.start, &run.data).await?;
        }
        Ok(())
    }

    /// Commit and persist: the `fd_sync`/`fd_datasync`/close path.
    pub async fn sync(&mut self) -> Result<(), Error> {
        self.commit().await?;
        self.handle.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::MemFile;

    fn file_of(content: &[u8]) -> (Arc<MemFile>, OpenFile) {
        let mem = MemFile::with_content(content);
        (mem.clone(), OpenFile::new(mem))
    }

    #[tokio::test]
    async fn sequential_writes_buffer_and_commit() {
        let (mem, mut file) = file_of(b"");
        file.write(b"hel").await.unwrap();
        file.write(b"lo").await.unwrap();
        // nothing handed over yet
        assert_eq!(mem.content(), b"");
        file.sync().await.unwrap();
        assert_eq!(mem.content(), b"hello");
        // sync again is a no-op
        file.sync().await.unwrap();
        assert_eq!(mem.content(), b"hello");
    }

    #[tokio::test]
    async fn read_sees_pending_writes() {
        let (_, mut file) = file_of(b"");
        file.write(b"abc").await.unwrap();
        file.seek(Whence::Set, 0).await.unwrap();
        let data = file.read(16).await.unwrap();
        assert_eq!(&data[..], b"abc");
    }

    #[tokio::test]
    async fn non_contiguous_write_flushes_first() {
        let (mem, mut file) = file_of(b"");
        file.write(b"aaaa").await.unwrap();
        file.seek(Whence::Set, 1).await.unwrap();
        file.write(b"b").await.unwrap();
        file.sync().await.unwrap();
        assert_eq!(mem.content(), b"abaa");
    }

    #[tokio::test]
    async fn seek_rules() {
        let (_, mut file) = file_of(b"0123456789");
        assert_eq!(file.seek(Whence::End, -4).await.unwrap(), 6);
        assert_eq!(file.seek(Whence::Cur, 2).await.unwrap(), 8);
        assert_eq!(file.seek(Whence::Cur, 0).await.unwrap(), 8);
        assert!(file.seek(Whence::Set, -1).await.is_err());
        assert!(file.seek(Whence::Cur, -20).await.is_err());
    }

    #[tokio::test]
    async fn write_past_end_extends() {
        let (mem, mut file) = file_of(b"ab");
        file.seek(Whence::Set, 4).await.unwrap();
        file.write(b"cd").await.unwrap();
        file.sync().await.unwrap();
        assert_eq!(mem.content(), b"ab\0\0cd");
    }
}
