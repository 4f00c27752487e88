//! An in-memory filesystem implementing the collaborator contract.
//!
//! Useful as a sandbox mount for tests and embedders that want a virtual
//! tree. Operations complete immediately; wrap handles in [`paced`]
//! adapters to simulate a provider that actually suspends.

use crate::error::Error;
use crate::fs::{
    DirEntryInfo, DirHandle, EntryKind, EntryStream, FileHandle, FileMeta, LookupKind, Node,
    OpenMode,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct MemFileState {
    content: Vec<u8>,
    modified_ms: u64,
}

pub struct MemFile {
    state: Mutex<MemFileState>,
}

impl MemFile {
    pub fn with_content(content: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemFileState {
                content: content.to_vec(),
                modified_ms: now_ms(),
            }),
        })
    }

    pub fn content(&self) -> Vec<u8> {
        self.state.lock().unwrap().content.clone()
    }

    fn truncate(&self) {
        let mut state = self.state.lock().unwrap();
        state.content.clear();
        state.modified_ms = now_ms();
    }
}

#[async_trait::async_trait]
impl FileHandle for MemFile {
    async fn meta(&self) -> Result<FileMeta, Error> {
        let state = self.state.lock().unwrap();
        Ok(FileMeta {
            size: state.content.len() as u64,
            modified_ms: state.modified_ms,
        })
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let state = self.state.lock().unwrap();
        let start = (offset as usize).min(state.content.len());
        let end = start.saturating_add(len).min(state.content.len());
        Ok(Bytes::copy_from_slice(&state.content[start..end]))
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let end = offset as usize + data.len();
        if state.content.len() < end {
            state.content.resize(end, 0);
        }
        state.content[offset as usize..end].copy_from_slice(data);
        state.modified_ms = now_ms();
        Ok(())
    }

    async fn set_len(&self, size: u64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.content.resize(size as usize, 0);
        state.modified_ms = now_ms();
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone)]
enum MemNode {
    File(Arc<MemFile>),
    Dir(Arc<MemDir>),
}

pub struct MemDir {
    children: Mutex<BTreeMap<String, MemNode>>,
}

/// The directory holding a path's final component: the receiver itself for
/// single-segment paths, a descendant otherwise.
enum Parent<'a> {
    Root(&'a MemDir),
    Nested(Arc<MemDir>),
}

impl Parent<'_> {
    fn children(&self) -> MutexGuard<'_, BTreeMap<String, MemNode>> {
        match self {
            Parent::Root(dir) => dir.children.lock().unwrap(),
            Parent::Nested(dir) => dir.children.lock().unwrap(),
        }
    }
}

impl MemDir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            children: Mutex::new(BTreeMap::new()),
        })
    }

    /// Create a file at a `/`-separated path, making intermediate
    /// directories.
    pub fn put_file(&self, path: &str, content: &[u8]) -> Result<Arc<MemFile>, Error> {
        let (parent, name) = self.locate_parent(path, true)?;
        let file = MemFile::with_content(content);
        parent
            .children()
            .insert(name, MemNode::File(file.clone()));
        Ok(file)
    }

    /// Create a directory at a `/`-separated path, making intermediates.
    pub fn mkdir(&self, path: &str) -> Result<Arc<MemDir>, Error> {
        let (parent, name) = self.locate_parent(path, true)?;
        let mut children = parent.children();
        match children.get(&name) {
            Some(MemNode::Dir(d)) => Ok(d.clone()),
            Some(MemNode::File(_)) => Err(Error::not_dir().context(path.to_owned())),
            None => {
                let child = MemDir::new();
                children.insert(name, MemNode::Dir(child.clone()));
                Ok(child)
            }
        }
    }

    fn step(&self, seg: &str, create: bool, path: &str) -> Result<Arc<MemDir>, Error> {
        let mut children = self.children.lock().unwrap();
        match children.get(seg) {
            Some(MemNode::Dir(d)) => Ok(d.clone()),
            Some(MemNode::File(_)) => Err(Error::not_dir().context(format!("{seg} in {path}"))),
            None if create => {
                let child = MemDir::new();
                children.insert(seg.to_owned(), MemNode::Dir(child.clone()));
                Ok(child)
            }
            None => Err(Error::not_found().context(format!("{seg} in {path}"))),
        }
    }

    fn locate_parent<'a>(&'a self, path: &str, create: bool) -> Result<(Parent<'a>, String), Error> {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let name = segments
            .pop()
            .ok_or_else(|| Error::invalid_argument().context("empty path"))?;
        let Some(first) = segments.first() else {
            return Ok((Parent::Root(self), name.to_owned()));
        };
        let mut dir = self.step(first, create, path)?;
        for seg in &segments[1..] {
            let next = dir.step(seg, create, path)?;
            dir = next;
        }
        Ok((Parent::Nested(dir), name.to_owned()))
    }
}

#[async_trait::async_trait]
impl DirHandle for MemDir {
    async fn open_at(&self, path: &str, kind: LookupKind, mode: OpenMode) -> Result<Node, Error> {
        // the runtime resolves the mount root itself; `path` is never empty
        let (parent, name) = self.locate_parent(path, false)?;
        let mut children = parent.children();
        match children.get(&name) {
            Some(_) if mode.contains(OpenMode::CREATE | OpenMode::EXCLUSIVE) => {
                Err(Error::exist().context(path.to_owned()))
            }
            Some(MemNode::File(file)) => match kind {
                LookupKind::Dir => Err(Error::not_dir().context(path.to_owned())),
                _ => {
                    if mode.contains(OpenMode::TRUNCATE) {
                        file.truncate();
                    }
                    Ok(Node::File(file.clone()))
                }
            },
            Some(MemNode::Dir(dir)) => match kind {
                LookupKind::File => Err(Error::is_dir().context(path.to_owned())),
                _ => Ok(Node::Dir(dir.clone())),
            },
            None if mode.contains(OpenMode::CREATE) => {
                if kind == LookupKind::Dir {
                    let dir = MemDir::new();
                    children.insert(name, MemNode::Dir(dir.clone()));
                    Ok(Node::Dir(dir))
                } else {
                    let file = MemFile::with_content(b"");
                    children.insert(name, MemNode::File(file.clone()));
                    Ok(Node::File(file))
                }
            }
            None => Err(Error::not_found().context(path.to_owned())),
        }
    }

    async fn remove(&self, path: &str) -> Result<(), Error> {
        let (parent, name) = self.locate_parent(path, false)?;
        let mut children = parent.children();
        match children.get(&name) {
            None => Err(Error::not_found().context(path.to_owned())),
            Some(MemNode::Dir(dir)) if !dir.children.lock().unwrap().is_empty() => {
                Err(Error::not_empty().context(path.to_owned()))
            }
            Some(_) => {
                children.remove(&name);
                Ok(())
            }
        }
    }

    async fn read_entries(&self, cursor: u64) -> Result<Box<dyn EntryStream>, Error> {
        let entries: Vec<DirEntryInfo> = self
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|(name, node)| DirEntryInfo {
                name: name.clone(),
                kind: match node {
                    MemNode::File(_) => EntryKind::File,
                    MemNode::Dir(_) => EntryKind::Dir,
                },
            })
            .collect();
        Ok(Box::new(MemEntries {
            entries,
            pos: cursor as usize,
        }))
    }
}

struct MemEntries {
    entries: Vec<DirEntryInfo>,
    pos: usize,
}

#[async_trait::async_trait]
impl EntryStream for MemEntries {
    async fn next(&mut self) -> Result<Option<DirEntryInfo>, Error> {
        let entry = self.entries.get(self.pos).cloned();
        self.pos += 1;
        Ok(entry)
    }
}

pub mod paced {
    //! Adapters that force a provider to suspend: each operation yields to
    //! the scheduler once before delegating. Simulates real latency and
    //! exercises the unwind/rewind path end to end.

    use super::*;

    pub struct PacedDir(pub Arc<dyn DirHandle>);
    pub struct PacedFile(pub Arc<dyn FileHandle>);

    #[async_trait::async_trait]
    impl DirHandle for PacedDir {
        async fn open_at(
            &self,
            path: &str,
            kind: LookupKind,
            mode: OpenMode,
        ) -> Result<Node, Error> {
            tokio::task::yield_now().await;
            match self.0.open_at(path, kind, mode).await? {
                Node::File(f) => Ok(Node::File(Arc::new(PacedFile(f)))),
                Node::Dir(d) => Ok(Node::Dir(Arc::new(PacedDir(d)))),
            }
        }

        async fn remove(&self, path: &str) -> Result<(), Error> {
            tokio::task::yield_now().await;
            self.0.remove(path).await
        }

        async fn read_entries(&self, cursor: u64) -> Result<Box<dyn EntryStream>, Error> {
            tokio::task::yield_now().await;
            self.0.read_entries(cursor).await
        }
    }

    #[async_trait::async_trait]
    impl FileHandle for PacedFile {
        async fn meta(&self) -> Result<FileMeta, Error> {
            tokio::task::yield_now().await;
            self.0.meta().await
        }

        async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
            tokio::task::yield_now().await;
            self.0.read_at(offset, len).await
        }

        async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
            tokio::task::yield_now().await;
            self.0.write_at(offset, data).await
        }

        async fn set_len(&self, size: u64) -> Result<(), Error> {
            tokio::task::yield_now().await;
            self.0.set_len(size).await
        }

        async fn flush(&self) -> Result<(), Error> {
            tokio::task::yield_now().await;
            self.0.flush().await
        }
    }
}
