//! A capstan filesystem provider backed by a real directory.
//!
//! [`DirFs`] implements the collaborator traits over `tokio::fs`. The
//! runtime has already normalized every path it hands over, but segments
//! are validated again here so the type is safe to use standalone; the
//! mount never escapes its root. Symbolic links are outside the hosted
//! model and are refused rather than followed.

use bytes::Bytes;
use capstan::fs::{
    DirEntryInfo, DirHandle, EntryKind, EntryStream, FileHandle, FileMeta, LookupKind, Node,
    OpenMode,
};
use capstan::{Errno, Error};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

fn errno_from_io(err: &std::io::Error) -> Errno {
    match err.kind() {
        ErrorKind::NotFound => Errno::Noent,
        ErrorKind::PermissionDenied => Errno::Acces,
        ErrorKind::AlreadyExists => Errno::Exist,
        ErrorKind::NotADirectory => Errno::Notdir,
        ErrorKind::IsADirectory => Errno::Isdir,
        ErrorKind::DirectoryNotEmpty => Errno::Notempty,
        ErrorKind::InvalidInput => Errno::Inval,
        _ => Errno::Acces,
    }
}

fn io_err(err: std::io::Error, what: &Path) -> Error {
    Error::from(errno_from_io(&err)).context(format!("{}: {err}", what.display()))
}

/// A mount rooted at a host directory.
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }

    fn host_path(&self, guest_path: &str) -> Result<PathBuf, Error> {
        let mut host = self.root.clone();
        for seg in guest_path.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    return Err(Error::not_capable()
                        .context(format!("{guest_path:?} escapes the mount root")))
                }
                seg if seg.contains(['/', '\\']) => {
                    return Err(Error::invalid_argument().context(format!("bad segment {seg:?}")))
                }
                seg => host.push(seg),
            }
        }
        Ok(host)
    }
}

#[async_trait::async_trait]
impl DirHandle for DirFs {
    async fn open_at(&self, path: &str, kind: LookupKind, mode: OpenMode) -> Result<Node, Error> {
        let host = self.host_path(path)?;
        match tokio::fs::symlink_metadata(&host).await {
            Ok(meta) if meta.is_symlink() => {
                Err(Error::not_found().context(format!("{host:?} is a symbolic link")))
            }
            Ok(_) if mode.contains(OpenMode::CREATE | OpenMode::EXCLUSIVE) => {
                Err(Error::exist().context(format!("{}", host.display())))
            }
            Ok(meta) if meta.is_dir() => match kind {
                LookupKind::File => Err(Error::is_dir().context(format!("{}", host.display()))),
                _ => Ok(Node::Dir(DirFs::new(host))),
            },
            Ok(_) => match kind {
                LookupKind::Dir => Err(Error::not_dir().context(format!("{}", host.display()))),
                _ => {
                    if mode.contains(OpenMode::TRUNCATE) {
                        tokio::fs::File::create(&host)
                            .await
                            .map_err(|e| io_err(e, &host))?;
                    }
                    Ok(Node::File(Arc::new(DirFile { path: host })))
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound && mode.contains(OpenMode::CREATE) => {
                if kind == LookupKind::Dir {
                    tokio::fs::create_dir(&host)
                        .await
                        .map_err(|e| io_err(e, &host))?;
                    Ok(Node::Dir(DirFs::new(host)))
                } else {
                    tokio::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&host)
                        .await
                        .map_err(|e| io_err(e, &host))?;
                    Ok(Node::File(Arc::new(DirFile { path: host })))
                }
            }
            Err(err) => Err(io_err(err, &host)),
        }
    }

    async fn remove(&self, path: &str) -> Result<(), Error> {
        let host = self.host_path(path)?;
        let meta = tokio::fs::symlink_metadata(&host)
            .await
            .map_err(|e| io_err(e, &host))?;
        if meta.is_dir() {
            tokio::fs::remove_dir(&host)
                .await
                .map_err(|e| io_err(e, &host))
        } else {
            tokio::fs::remove_file(&host)
                .await
                .map_err(|e| io_err(e, &host))
        }
    }

    async fn read_entries(&self, cursor: u64) -> Result<Box<dyn EntryStream>, Error> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_err(e, &self.root))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_err(e, &self.root))? {
            let kind = match entry.file_type().await {
                Ok(t) if t.is_dir() => EntryKind::Dir,
                Ok(_) => EntryKind::File,
                Err(_) => continue,
            };
            let Ok(name) = entry.file_name().into_string() else {
                tracing::debug!(path = %self.root.display(), "skipping non-UTF-8 entry");
                continue;
            };
            entries.push(DirEntryInfo { name, kind });
        }
        // read_dir order is platform-dependent; cookies need a stable one
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Box::new(HostEntries {
            entries,
            pos: cursor as usize,
        }))
    }
}

struct HostEntries {
    entries: Vec<DirEntryInfo>,
    pos: usize,
}

#[async_trait::async_trait]
impl EntryStream for HostEntries {
    async fn next(&mut self) -> Result<Option<DirEntryInfo>, Error> {
        let entry = self.entries.get(self.pos).cloned();
        self.pos += 1;
        Ok(entry)
    }
}

/// A regular file inside a [`DirFs`] mount. Each operation opens the file
/// afresh; the runtime's own write buffering keeps this from being one
/// open per guest write.
pub struct DirFile {
    path: PathBuf,
}

#[async_trait::async_trait]
impl FileHandle for DirFile {
    async fn meta(&self) -> Result<FileMeta, Error> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| io_err(e, &self.path))?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(FileMeta {
            size: meta.len(),
            modified_ms,
        })
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| io_err(e, &self.path))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_err(e, &self.path))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| io_err(e, &self.path))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| io_err(e, &self.path))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_err(e, &self.path))?;
        file.write_all(data)
            .await
            .map_err(|e| io_err(e, &self.path))?;
        file.flush().await.map_err(|e| io_err(e, &self.path))
    }

    async fn set_len(&self, size: u64) -> Result<(), Error> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| io_err(e, &self.path))?;
        file.set_len(size).await.map_err(|e| io_err(e, &self.path))
    }

    async fn flush(&self) -> Result<(), Error> {
        // write_at already pushed everything through the OS; durability
        // syncing is the embedder's business
        Ok(())
    }
}
