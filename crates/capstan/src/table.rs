//! The virtual file-descriptor table.
//!
//! Descriptors 0..=2 belong to the standard streams and appear here only
//! when a guest renumbers an open file onto them (how libc reopens stdio).
//! Pre-opens occupy `FIRST_PREOPEN_FD..` in insertion order; dynamic
//! descriptors take the lowest unused number above the streams.

use crate::abi::FIRST_PREOPEN_FD;
use crate::dir::OpenDirectory;
use crate::error::Error;
use crate::file::OpenFile;
use crate::fs::DirHandle;
use crate::path;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A mount: an absolute guest path paired with the directory capability
/// that backs it.
pub struct Preopen {
    pub guest_path: String,
    pub dir: Arc<dyn DirHandle>,
}

impl std::fmt::Debug for Preopen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preopen")
            .field("guest_path", &self.guest_path)
            .finish_non_exhaustive()
    }
}

/// What an fd refers to.
#[derive(Clone)]
pub enum Descriptor {
    Preopen(Arc<Preopen>),
    File(Arc<Mutex<OpenFile>>),
    Dir(Arc<Mutex<OpenDirectory>>),
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Descriptor::Preopen(p) => f.debug_tuple("Preopen").field(p).finish(),
            Descriptor::File(_) => f.write_str("Descriptor::File(..)"),
            Descriptor::Dir(_) => f.write_str("Descriptor::Dir(..)"),
        }
    }
}

pub struct FdTable {
    entries: BTreeMap<u32, Descriptor>,
}

impl FdTable {
    /// Build the table, assigning each pre-open its stable fd.
    pub fn new(preopens: Vec<Preopen>) -> Self {
        let entries = preopens
            .into_iter()
            .enumerate()
            .map(|(i, p)| (FIRST_PREOPEN_FD + i as u32, Descriptor::Preopen(Arc::new(p))))
            .collect();
        Self { entries }
    }

    pub fn get(&self, fd: u32) -> Result<&Descriptor, Error> {
        self.entries
            .get(&fd)
            .ok_or_else(|| Error::badf().context(format!("fd {fd} not in table")))
    }

    pub fn contains(&self, fd: u32) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn get_preopen(&self, fd: u32) -> Result<Arc<Preopen>, Error> {
        match self.get(fd)? {
            Descriptor::Preopen(p) => Ok(p.clone()),
            _ => Err(Error::badf().context(format!("fd {fd} is not a pre-open"))),
        }
    }

    pub fn get_file(&self, fd: u32) -> Result<Arc<Mutex<OpenFile>>, Error> {
        match self.get(fd)? {
            Descriptor::File(f) => Ok(f.clone()),
            _ => Err(Error::badf().context(format!("fd {fd} is not an open file"))),
        }
    }

    pub fn get_dir(&self, fd: u32) -> Result<Arc<Mutex<OpenDirectory>>, Error> {
        match self.get(fd)? {
            Descriptor::Dir(d) => Ok(d.clone()),
            Descriptor::File(_) => {
                Err(Error::not_dir().context(format!("fd {fd} is an open file")))
            }
            Descriptor::Preopen(_) => {
                Err(Error::badf().context(format!("fd {fd} is a pre-open, not an opened directory")))
            }
        }
    }

    fn alloc(&self) -> u32 {
        let mut next = FIRST_PREOPEN_FD;
        for &fd in self.entries.keys() {
            if fd < next {
                continue;
            }
            if fd != next {
                break;
            }
            next += 1;
        }
        next
    }

    pub fn insert_file(&mut self, file: OpenFile) -> u32 {
        let fd = self.alloc();
        self.entries
            .insert(fd, Descriptor::File(Arc::new(Mutex::new(file))));
        tracing::debug!(fd, "opened file");
        fd
    }

    pub fn insert_dir(&mut self, dir: OpenDirectory) -> u32 {
        let fd = self.alloc();
        self.entries
            .insert(fd, Descriptor::Dir(Arc::new(Mutex::new(dir))));
        tracing::debug!(fd, "opened directory");
        fd
    }

    pub fn remove(&mut self, fd: u32) -> Option<Descriptor> {
        let removed = self.entries.remove(&fd);
        if removed.is_some() {
            tracing::debug!(fd, "closed");
        }
        removed
    }

    /// Move `from`'s entry to `to`, returning whatever `to` held so the
    /// caller can release it.
    pub fn renumber(&mut self, from: u32, to: u32) -> Result<Option<Descriptor>, Error> {
        if from == to {
            return Ok(None);
        }
        let entry = self
            .entries
            .remove(&from)
            .ok_or_else(|| Error::badf().context(format!("renumber source fd {from}")))?;
        Ok(self.entries.insert(to, entry))
    }

    /// Pre-opens in fd order.
    pub fn preopens(&self) -> impl Iterator<Item = (u32, &Arc<Preopen>)> {
        self.entries.iter().filter_map(|(fd, d)| match d {
            Descriptor::Preopen(p) => Some((*fd, p)),
            _ => None,
        })
    }

    /// Resolve an absolute guest path to the pre-open with the longest
    /// whole-segment prefix, plus the remaining relative path.
    pub fn find_relpath<'a>(&self, abs: &'a str) -> Result<(Arc<Preopen>, &'a str), Error> {
        let mut best: Option<(Arc<Preopen>, &str)> = None;
        for (_, preopen) in self.preopens() {
            if let Some(rest) = path::strip_prefix(&preopen.guest_path, abs) {
                match &best {
                    Some((prev, _)) if prev.guest_path.len() >= preopen.guest_path.len() => {}
                    _ => best = Some((preopen.clone(), rest)),
                }
            }
        }
        best.ok_or_else(|| Error::not_found().context(format!("no pre-open matches {abs:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::MemDir;

    fn table() -> FdTable {
        FdTable::new(vec![
            Preopen {
                guest_path: "/sandbox".into(),
                dir: MemDir::new(),
            },
            Preopen {
                guest_path: "/sandbox2".into(),
                dir: MemDir::new(),
            },
        ])
    }

    fn open_file() -> OpenFile {
        OpenFile::new(crate::virt::MemFile::with_content(b""))
    }

    #[test]
    fn preopens_take_fds_from_three() {
        let t = table();
        assert!(t.get_preopen(3).is_ok());
        assert!(t.get_preopen(4).is_ok());
        assert_eq!(t.get_preopen(5).unwrap_err().errno(), Some(crate::Errno::Badf));
    }

    #[test]
    fn lowest_unused_allocation_with_reuse() {
        let mut t = table();
        let a = t.insert_file(open_file());
        let b = t.insert_file(open_file());
        assert_eq!((a, b), (5, 6));
        t.remove(5);
        assert_eq!(t.insert_file(open_file()), 5);
        assert_eq!(t.insert_file(open_file()), 7);
    }

    #[test]
    fn renumber_moves_and_evicts() {
        let mut t = table();
        let a = t.insert_file(open_file());
        let b = t.insert_file(open_file());
        let victim = t.renumber(a, b).unwrap();
        assert!(matches!(victim, Some(Descriptor::File(_))));
        assert!(!t.contains(a));
        assert!(t.get_file(b).is_ok());
        // renumber onto a standard-stream fd shadows the stream
        let c = t.insert_file(open_file());
        t.renumber(c, 0).unwrap();
        assert!(t.get_file(0).is_ok());
        assert_eq!(t.renumber(99, 3).unwrap_err().errno(), Some(crate::Errno::Badf));
    }

    #[test]
    fn longest_prefix_wins_whole_segment() {
        let t = table();
        let (p, rest) = t.find_relpath("/sandbox2/data.bin").unwrap();
        assert_eq!(p.guest_path, "/sandbox2");
        assert_eq!(rest, "data.bin");
        let (p, rest) = t.find_relpath("/sandbox/x/y").unwrap();
        assert_eq!(p.guest_path, "/sandbox");
        assert_eq!(rest, "x/y");
        assert_eq!(
            t.find_relpath("/elsewhere").unwrap_err().errno(),
            Some(crate::Errno::Noent)
        );
    }
}
