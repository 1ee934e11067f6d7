//! File Byte-Range Locking
//!
//! Per-FCB table of byte-range locks. The driver only consumes two queries
//! from it when arbitrating oplocks:
//!
//! - [`FileLock::check_lock_for_oplock_request`]: would the current lock
//!   state deny a shared oplock
//! - [`FileLock::are_there_current_or_in_progress_locks`]: coarse fallback
//!   used when the direct query is unavailable
//!
//! Lock requests that conflict and are allowed to wait are queued as
//! in-progress and granted when the conflicting range is unlocked.

use alloc::vec::Vec;
use spin::Mutex;

/// Information about a single file lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileLockInfo {
    /// Starting byte offset of the locked range
    pub starting_byte: i64,
    /// Length of the locked range in bytes
    pub length: i64,
    /// Whether this is an exclusive lock
    pub exclusive_lock: bool,
    /// Lock key (typically process-specific)
    pub key: u32,
    /// Identifier of the file object that owns this lock
    pub owner: u64,
}

impl FileLockInfo {
    pub const fn new(owner: u64, starting_byte: i64, length: i64, key: u32, exclusive: bool) -> Self {
        Self {
            starting_byte,
            length,
            exclusive_lock: exclusive,
            key,
            owner,
        }
    }

    /// Ending byte offset (exclusive)
    #[inline]
    pub fn ending_byte(&self) -> i64 {
        self.starting_byte.saturating_add(self.length)
    }

    /// Check if this lock overlaps with a range
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.starting_byte < end && self.ending_byte() > start
    }

    /// Check if this lock conflicts with a requested lock
    pub fn conflicts_with(&self, request: &FileLockInfo) -> bool {
        // Same owner with same key can always extend/overlap their own locks
        if self.owner == request.owner && self.key == request.key {
            return false;
        }

        if !self.overlaps(request.starting_byte, request.ending_byte()) {
            return false;
        }

        // Shared locks only conflict with exclusive locks
        self.exclusive_lock || request.exclusive_lock
    }
}

/// Outcome of a lock request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Conflicting request queued; it is granted by a later unlock
    Pending,
    Denied,
}

#[derive(Default)]
struct FileLockState {
    granted: Vec<FileLockInfo>,
    waiting: Vec<FileLockInfo>,
}

impl FileLockState {
    fn conflicts(&self, request: &FileLockInfo) -> bool {
        self.granted.iter().any(|existing| existing.conflicts_with(request))
    }

    /// Grant every waiting request that no longer conflicts, oldest first
    fn grant_waiters(&mut self) {
        let mut index = 0;
        while index < self.waiting.len() {
            if self.conflicts(&self.waiting[index]) {
                index += 1;
            } else {
                let info = self.waiting.remove(index);
                self.granted.push(info);
            }
        }
    }
}

/// Byte-range lock table for a single file stream
#[derive(Default)]
pub struct FileLock {
    state: Mutex<FileLockState>,
}

impl FileLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a lock. With `fail_immediately` a conflict is denied instead
    /// of queued.
    pub fn process_lock(&self, request: FileLockInfo, fail_immediately: bool) -> LockOutcome {
        if request.length < 0 || request.starting_byte < 0 {
            return LockOutcome::Denied;
        }

        let mut state = self.state.lock();
        if !state.conflicts(&request) {
            state.granted.push(request);
            return LockOutcome::Granted;
        }
        if fail_immediately {
            return LockOutcome::Denied;
        }
        state.waiting.push(request);
        LockOutcome::Pending
    }

    /// Remove one lock matching owner, key and range exactly
    pub fn unlock_single(&self, owner: u64, starting_byte: i64, length: i64, key: u32) -> bool {
        let mut state = self.state.lock();
        let position = state.granted.iter().position(|existing| {
            existing.owner == owner
                && existing.key == key
                && existing.starting_byte == starting_byte
                && existing.length == length
        });

        match position {
            Some(index) => {
                state.granted.remove(index);
                state.grant_waiters();
                true
            }
            None => false,
        }
    }

    /// Remove every lock and queued request owned by a file object
    pub fn unlock_all(&self, owner: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.granted.len() + state.waiting.len();
        state.granted.retain(|existing| existing.owner != owner);
        state.waiting.retain(|queued| queued.owner != owner);
        let removed = state.granted.len() + state.waiting.len() != before;
        state.grant_waiters();
        removed
    }

    /// Whether the current lock state permits a shared oplock on a file of
    /// `allocation_size` bytes.
    ///
    /// Denied when any exclusive lock is held or queued, or when a shared
    /// lock reaches past the allocation.
    pub fn check_lock_for_oplock_request(&self, allocation_size: i64) -> bool {
        let state = self.state.lock();
        if !state.waiting.is_empty() {
            return false;
        }
        !state
            .granted
            .iter()
            .any(|lock| lock.exclusive_lock || lock.ending_byte() > allocation_size)
    }

    /// Whether any lock is granted or waiting to be granted
    pub fn are_there_current_or_in_progress_locks(&self) -> bool {
        let state = self.state.lock();
        !state.granted.is_empty() || !state.waiting.is_empty()
    }

    /// Whether a read of the range by `owner` is permitted
    pub fn check_read_access(&self, owner: u64, starting_byte: i64, length: i64, key: u32) -> bool {
        let probe = FileLockInfo::new(owner, starting_byte, length, key, false);
        !self.state.lock().conflicts(&probe)
    }

    /// Whether a write of the range by `owner` is permitted
    pub fn check_write_access(&self, owner: u64, starting_byte: i64, length: i64, key: u32) -> bool {
        let probe = FileLockInfo::new(owner, starting_byte, length, key, true);
        !self.state.lock().conflicts(&probe)
    }

    /// Number of granted locks
    pub fn lock_count(&self) -> usize {
        self.state.lock().granted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_locks_coexist() {
        let lock = FileLock::new();
        assert_eq!(lock.process_lock(FileLockInfo::new(1, 0, 100, 0, false), true), LockOutcome::Granted);
        assert_eq!(lock.process_lock(FileLockInfo::new(2, 50, 100, 0, false), true), LockOutcome::Granted);
        assert_eq!(lock.lock_count(), 2);
        assert!(lock.check_read_access(3, 0, 10, 0));
        assert!(!lock.check_write_access(3, 0, 10, 0));
    }

    #[test]
    fn test_exclusive_conflict_queues_then_grants() {
        let lock = FileLock::new();
        assert_eq!(lock.process_lock(FileLockInfo::new(1, 0, 100, 0, true), true), LockOutcome::Granted);
        assert_eq!(lock.process_lock(FileLockInfo::new(2, 10, 10, 0, false), true), LockOutcome::Denied);
        assert_eq!(lock.process_lock(FileLockInfo::new(2, 10, 10, 0, false), false), LockOutcome::Pending);

        assert!(lock.unlock_single(1, 0, 100, 0));
        assert_eq!(lock.lock_count(), 1);
        assert!(lock.are_there_current_or_in_progress_locks());

        assert!(lock.unlock_all(2));
        assert!(!lock.are_there_current_or_in_progress_locks());
    }

    #[test]
    fn test_oplock_queries() {
        let lock = FileLock::new();
        assert!(lock.check_lock_for_oplock_request(4096));
        assert!(!lock.are_there_current_or_in_progress_locks());

        lock.process_lock(FileLockInfo::new(1, 0, 512, 0, false), true);
        assert!(lock.check_lock_for_oplock_request(4096));
        assert!(lock.are_there_current_or_in_progress_locks());

        lock.process_lock(FileLockInfo::new(1, 4000, 512, 0, false), true);
        assert!(!lock.check_lock_for_oplock_request(4096));

        lock.unlock_all(1);
        lock.process_lock(FileLockInfo::new(1, 0, 1, 0, true), true);
        assert!(!lock.check_lock_for_oplock_request(4096));
    }
}
