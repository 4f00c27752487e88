//! The backing state of a directory descriptor: a resumable enumeration
//! keyed by a 64-bit cookie.

use crate::error::Error;
use crate::fs::{DirEntryInfo, DirHandle, EntryStream};
use std::sync::Arc;

struct DirCursor {
    stream: Box<dyn EntryStream>,
    /// Ordinal of the next entry the cursor will yield.
    pos: u64,
    /// One entry pushed back because it did not fit the guest buffer.
    reverted: Option<DirEntryInfo>,
}

/// An open directory. `next_at` continues the current enumeration when the
/// requested cookie matches its position and restarts the provider stream
/// otherwise.
pub struct OpenDirectory {
    handle: Arc<dyn DirHandle>,
    cursor: Option<DirCursor>,
}

impl OpenDirectory {
    pub fn new(handle: Arc<dyn DirHandle>) -> Self {
        Self {
            handle,
            cursor: None,
        }
    }

    pub fn handle(&self) -> &Arc<dyn DirHandle> {
        &self.handle
    }

    /// Yield the entry at ordinal `cookie`, or `None` at the end.
    pub async fn next_at(&mut self, cookie: u64) -> Result<Option<DirEntryInfo>, Error> {
        match &self.cursor {
            Some(cursor) if cursor.pos == cookie => {}
            _ => {
                self.cursor = Some(DirCursor {
                    stream: self.handle.read_entries(cookie).await?,
                    pos: cookie,
                    reverted: None,
                });
            }
        }
        let cursor = self.cursor.as_mut().unwrap();
        if let Some(entry) = cursor.reverted.take() {
            cursor.pos += 1;
            return Ok(Some(entry));
        }
        match cursor.stream.next().await? {
            Some(entry) => {
                cursor.pos += 1;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Push the most recently yielded entry back so the next `next_at`
    /// re-yields it.
    pub fn revert(&mut self, entry: DirEntryInfo) {
        let cursor = self
            .cursor
            .as_mut()
            .expect("revert without a live enumeration");
        debug_assert!(cursor.reverted.is_none());
        cursor.pos -= 1;
        cursor.reverted = Some(entry);
    }
}
