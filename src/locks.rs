//! In-memory advisory byte-range locks.
//!
//! One lock table per store instance, partitioned per file handle; every
//! transition on a file is serialized by its table entry. Nothing here is
//! persisted: locks evaporate at store shutdown and the protocol layers
//! reclaim them through their own grace periods.

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::handle::FileHandle;
use crate::model::{Clock, Timestamp};

/// Opaque lock-owner identifier assigned by the protocol layer.
pub type SessionId = u64;

/// One byte-range lock. `length == 0` means "from offset to end of file".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRangeLock {
    pub session_id: SessionId,
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
    pub acquired_at: Timestamp,
}

impl ByteRangeLock {
    fn overlaps(&self, offset: u64, length: u64) -> bool {
        ranges_overlap(self.offset, self.length, offset, length)
    }
}

fn range_end(offset: u64, length: u64) -> u64 {
    if length == 0 {
        u64::MAX
    } else {
        offset.saturating_add(length)
    }
}

fn ranges_overlap(a_offset: u64, a_length: u64, b_offset: u64, b_length: u64) -> bool {
    a_offset < range_end(b_offset, b_length) && b_offset < range_end(a_offset, a_length)
}

/// Byte-range lock manager for NLM, NFSv4 and SMB lock operations.
pub struct LockManager {
    clock: Arc<dyn Clock>,
    tables: DashMap<FileHandle, Vec<ByteRangeLock>>,
}

impl LockManager {
    pub fn new(clock: Arc<dyn Clock>) -> LockManager {
        LockManager { clock, tables: DashMap::new() }
    }

    /// Acquire a lock, or fail with `locked` carrying the blocking record.
    ///
    /// Re-locking an exact `(session, offset, length)` match is idempotent
    /// and overwrites the exclusivity in place, which is how NLM clients
    /// upgrade and downgrade.
    pub fn lock(
        &self,
        handle: &FileHandle,
        session_id: SessionId,
        offset: u64,
        length: u64,
        exclusive: bool,
    ) -> StoreResult<()> {
        let mut entry = self.tables.entry(handle.clone()).or_default();
        if let Some(conflict) = find_conflict(&entry, session_id, offset, length, exclusive) {
            return Err(StoreError::Locked { conflict });
        }
        if let Some(existing) = entry
            .iter_mut()
            .find(|l| l.session_id == session_id && l.offset == offset && l.length == length)
        {
            existing.exclusive = exclusive;
            return Ok(());
        }
        entry.push(ByteRangeLock {
            session_id,
            offset,
            length,
            exclusive,
            acquired_at: self.clock.now(),
        });
        Ok(())
    }

    /// Report the record a hypothetical lock would collide with, without
    /// mutating state.
    pub fn test_lock(
        &self,
        handle: &FileHandle,
        session_id: SessionId,
        offset: u64,
        length: u64,
        exclusive: bool,
    ) -> Option<ByteRangeLock> {
        let entry = self.tables.get(handle)?;
        find_conflict(&entry, session_id, offset, length, exclusive)
    }

    /// Remove exactly one record matching `(session, offset, length)`.
    pub fn unlock(
        &self,
        handle: &FileHandle,
        session_id: SessionId,
        offset: u64,
        length: u64,
    ) -> StoreResult<()> {
        let mut removed = false;
        if let Some(mut entry) = self.tables.get_mut(handle) {
            if let Some(index) = entry
                .iter()
                .position(|l| l.session_id == session_id && l.offset == offset && l.length == length)
            {
                entry.remove(index);
                removed = true;
            }
        }
        if removed {
            self.drop_if_empty(handle);
            Ok(())
        } else {
            Err(StoreError::not_found("lock not found"))
        }
    }

    /// Drop every lock the session holds on this handle.
    pub fn unlock_all_for_session(&self, handle: &FileHandle, session_id: SessionId) {
        if let Some(mut entry) = self.tables.get_mut(handle) {
            entry.retain(|l| l.session_id != session_id);
        }
        self.drop_if_empty(handle);
    }

    /// I/O interlock: a read collides with another session's exclusive
    /// lock, a write collides with any other session's lock. The caller's
    /// own locks never block it.
    pub fn check_io(
        &self,
        handle: &FileHandle,
        session_id: SessionId,
        offset: u64,
        length: u64,
        is_write: bool,
    ) -> StoreResult<()> {
        let Some(entry) = self.tables.get(handle) else {
            return Ok(());
        };
        let blocking = entry.iter().find(|l| {
            l.session_id != session_id && l.overlaps(offset, length) && (is_write || l.exclusive)
        });
        match blocking {
            Some(conflict) => Err(StoreError::Locked { conflict: conflict.clone() }),
            None => Ok(()),
        }
    }

    /// Number of live records on a handle. Test and introspection aid.
    pub fn lock_count(&self, handle: &FileHandle) -> usize {
        self.tables.get(handle).map(|entry| entry.len()).unwrap_or(0)
    }

    fn drop_if_empty(&self, handle: &FileHandle) {
        self.tables.remove_if(handle, |_, locks| locks.is_empty());
    }
}

fn find_conflict(
    locks: &[ByteRangeLock],
    session_id: SessionId,
    offset: u64,
    length: u64,
    exclusive: bool,
) -> Option<ByteRangeLock> {
    locks
        .iter()
        .find(|l| {
            l.session_id != session_id
                && l.overlaps(offset, length)
                && (l.exclusive || exclusive)
        })
        .cloned()
}
