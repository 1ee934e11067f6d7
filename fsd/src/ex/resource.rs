//! Executive Resource (ERESOURCE)
//!
//! Reader-writer lock used for the device, volume and file control blocks
//! and for the global mount-manager lock.
//!
//! # Semantics
//!
//! - Any number of shared (read) owners, or exactly one exclusive (write) owner
//! - Exclusive waiters are preferred: new shared acquirers back off while an
//!   exclusive acquirer is spinning
//! - Acquisition blocks the calling thread; there is no cancellation
//!
//! Callers use [`EResource::acquire`], which returns a [`ResourceGuard`] that
//! releases on drop, so the lock is released on every exit path.
//!
//! # Usage
//! ```
//! use fsd::ex::resource::{AcquireMode, EResource};
//!
//! let resource = EResource::new();
//! {
//!     let _guard = resource.acquire(AcquireMode::Exclusive);
//!     assert!(resource.is_acquired_exclusive());
//! }
//! assert!(!resource.is_acquired());
//! ```

use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Resource flags
const RESOURCE_FLAG_EXCLUSIVE_WAITER: u32 = 0x1;
const RESOURCE_FLAG_SHARED_WAITER: u32 = 0x2;

/// Requested access to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Read access, compatible with other shared owners
    Shared,
    /// Write access, incompatible with everything else
    Exclusive,
}

impl fmt::Display for AcquireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireMode::Shared => f.write_str("RO"),
            AcquireMode::Exclusive => f.write_str("RW"),
        }
    }
}

/// Executive Resource
pub struct EResource {
    /// Count of active locks:
    /// - Positive: number of shared owners
    /// - -1: exclusively owned
    /// - Zero: not locked
    active_count: AtomicI32,

    /// Flags (RESOURCE_FLAG_*)
    flags: AtomicU32,

    /// Number of threads waiting for shared access
    shared_waiters: AtomicU32,

    /// Number of threads waiting for exclusive access
    exclusive_waiters: AtomicU32,

    /// Statistics: contended acquisitions
    contention_count: AtomicU32,
}

impl EResource {
    /// Create a new, unowned resource
    pub const fn new() -> Self {
        Self {
            active_count: AtomicI32::new(0),
            flags: AtomicU32::new(0),
            shared_waiters: AtomicU32::new(0),
            exclusive_waiters: AtomicU32::new(0),
            contention_count: AtomicU32::new(0),
        }
    }

    /// Acquire the resource in `mode`, blocking until it is available
    pub fn acquire(&self, mode: AcquireMode) -> ResourceGuard<'_> {
        match mode {
            AcquireMode::Shared => self.acquire_shared(true),
            AcquireMode::Exclusive => self.acquire_exclusive(true),
        };
        ResourceGuard {
            resource: self,
            mode,
        }
    }

    /// Try to acquire without waiting
    pub fn try_acquire(&self, mode: AcquireMode) -> Option<ResourceGuard<'_>> {
        let acquired = match mode {
            AcquireMode::Shared => self.acquire_shared(false),
            AcquireMode::Exclusive => self.acquire_exclusive(false),
        };
        acquired.then_some(ResourceGuard {
            resource: self,
            mode,
        })
    }

    /// Acquire exclusively. Returns false only when `wait` is false and the
    /// resource is held.
    fn acquire_exclusive(&self, wait: bool) -> bool {
        let mut waiting = false;

        loop {
            if self
                .active_count
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                if waiting {
                    self.leave_wait(&self.exclusive_waiters, RESOURCE_FLAG_EXCLUSIVE_WAITER);
                }
                return true;
            }

            if !wait {
                return false;
            }

            if !waiting {
                waiting = true;
                self.contention_count.fetch_add(1, Ordering::Relaxed);
                self.exclusive_waiters.fetch_add(1, Ordering::Relaxed);
                self.flags.fetch_or(RESOURCE_FLAG_EXCLUSIVE_WAITER, Ordering::Relaxed);
            }

            while self.active_count.load(Ordering::Relaxed) != 0 {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquire shared. Returns false only when `wait` is false and the
    /// resource is held exclusively or an exclusive waiter is queued.
    fn acquire_shared(&self, wait: bool) -> bool {
        let mut waiting = false;

        loop {
            let active = self.active_count.load(Ordering::Relaxed);
            let exclusive_queued =
                self.flags.load(Ordering::Relaxed) & RESOURCE_FLAG_EXCLUSIVE_WAITER != 0;

            if active >= 0 && !exclusive_queued {
                if self
                    .active_count
                    .compare_exchange_weak(active, active + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    if waiting {
                        self.leave_wait(&self.shared_waiters, RESOURCE_FLAG_SHARED_WAITER);
                    }
                    return true;
                }
                continue;
            }

            if !wait {
                return false;
            }

            if !waiting {
                waiting = true;
                self.contention_count.fetch_add(1, Ordering::Relaxed);
                self.shared_waiters.fetch_add(1, Ordering::Relaxed);
                self.flags.fetch_or(RESOURCE_FLAG_SHARED_WAITER, Ordering::Relaxed);
            }

            core::hint::spin_loop();
        }
    }

    fn leave_wait(&self, counter: &AtomicU32, flag: u32) {
        if counter.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.flags.fetch_and(!flag, Ordering::Relaxed);
        }
    }

    /// Release one acquisition. Only called by [`ResourceGuard`].
    fn release(&self, mode: AcquireMode) {
        match mode {
            AcquireMode::Exclusive => {
                debug_assert_eq!(self.active_count.load(Ordering::Relaxed), -1);
                self.active_count.store(0, Ordering::Release);
            }
            AcquireMode::Shared => {
                let previous = self.active_count.fetch_sub(1, Ordering::Release);
                debug_assert!(previous > 0, "shared release of a resource not held shared");
            }
        }
    }

    /// Check if resource is held exclusively
    #[inline]
    pub fn is_acquired_exclusive(&self) -> bool {
        self.active_count.load(Ordering::Relaxed) < 0
    }

    /// Check if resource is held (exclusively or shared)
    #[inline]
    pub fn is_acquired(&self) -> bool {
        self.active_count.load(Ordering::Relaxed) != 0
    }

    /// Check if resource is held in shared mode
    #[inline]
    pub fn is_acquired_shared(&self) -> bool {
        self.active_count.load(Ordering::Relaxed) > 0
    }

    /// Number of shared owners
    #[inline]
    pub fn shared_count(&self) -> u32 {
        let active = self.active_count.load(Ordering::Relaxed);
        if active > 0 { active as u32 } else { 0 }
    }

    /// Number of contended acquisitions so far
    #[inline]
    pub fn contention_count(&self) -> u32 {
        self.contention_count.load(Ordering::Relaxed)
    }
}

impl Default for EResource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EResource")
            .field("active_count", &self.active_count.load(Ordering::Relaxed))
            .field("contention_count", &self.contention_count())
            .finish()
    }
}

/// RAII guard for a held resource; releases in the mode it was acquired in
#[must_use = "the resource is released as soon as the guard is dropped"]
pub struct ResourceGuard<'a> {
    resource: &'a EResource,
    mode: AcquireMode,
}

impl ResourceGuard<'_> {
    /// Mode this guard holds the resource in
    #[inline]
    pub fn mode(&self) -> AcquireMode {
        self.mode
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        self.resource.release(self.mode);
    }
}
