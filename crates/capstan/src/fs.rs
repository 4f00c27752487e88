//! The host-filesystem collaborator contract.
//!
//! A mount supplies a [`DirHandle`]; everything the runtime does against the
//! host tree goes through these object-safe async traits. Paths handed to a
//! handle are already normalized: relative, `/`-separated, no `.` or `..`
//! segments, and never empty (the mount root itself is handled by the
//! caller).

use crate::abi::Filetype;
use crate::error::Error;
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::Arc;

/// What a lookup is required to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    File,
    Dir,
    Any,
}

/// What a directory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

impl From<EntryKind> for Filetype {
    fn from(kind: EntryKind) -> Filetype {
        match kind {
            EntryKind::File => Filetype::RegularFile,
            EntryKind::Dir => Filetype::Directory,
        }
    }
}

bitflags! {
    /// Creation behavior for [`DirHandle::open_at`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        /// Create the final component if absent.
        const CREATE = 1 << 0;
        /// With `CREATE`, fail with `EXIST` if the component is present.
        const EXCLUSIVE = 1 << 1;
        /// Open a file and reset its length to zero.
        const TRUNCATE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub modified_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKind,
}

/// An open node, as handed out by [`DirHandle::open_at`].
#[derive(Clone)]
pub enum Node {
    File(Arc<dyn FileHandle>),
    Dir(Arc<dyn DirHandle>),
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::File(_) => f.write_str("Node::File(..)"),
            Node::Dir(_) => f.write_str("Node::Dir(..)"),
        }
    }
}

/// A directory capability. One of these backs every mount and every open
/// directory fd.
#[async_trait::async_trait]
pub trait DirHandle: Send + Sync {
    /// Resolve `path` to a node, applying `mode` to the final component.
    ///
    /// Expected failures: `NOENT` for missing components, `NOTDIR` when an
    /// intermediate component is a file, `EXIST` for `CREATE | EXCLUSIVE`
    /// on a present component, `ISDIR`/`NOTDIR` when the node does not
    /// match `kind`.
    async fn open_at(&self, path: &str, kind: LookupKind, mode: OpenMode) -> Result<Node, Error>;

    /// Remove the entry at `path`. Fails `NOENT` if absent and `NOTEMPTY`
    /// for a non-empty directory.
    async fn remove(&self, path: &str) -> Result<(), Error>;

    /// Enumerate entries starting at ordinal `cursor`, in a stable order.
    async fn read_entries(&self, cursor: u64) -> Result<Box<dyn EntryStream>, Error>;
}

/// A regular-file capability.
#[async_trait::async_trait]
pub trait FileHandle: Send + Sync {
    async fn meta(&self) -> Result<FileMeta, Error>;

    /// Read up to `len` bytes at `offset`; short only at end of file.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error>;

    /// Write all of `data` at `offset`, extending the file as needed.
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error>;

    async fn set_len(&self, size: u64) -> Result<(), Error>;

    /// Persist outstanding writes. Idempotent.
    async fn flush(&self) -> Result<(), Error>;
}

/// A lazy, resumable directory enumeration.
#[async_trait::async_trait]
pub trait EntryStream: Send {
    async fn next(&mut self) -> Result<Option<DirEntryInfo>, Error>;
}
