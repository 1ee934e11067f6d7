//! Opportunistic Lock (Oplock) Support
//!
//! Oplocks allow clients to cache file data locally for improved performance.
//! When another client requests access that would invalidate the cache,
//! the oplock is "broken" and the caching client must flush/invalidate.
//!
//! Oplock types:
//! - Level 1 (Exclusive): Client has exclusive access, can cache reads and writes
//! - Level 2 (Shared): Multiple readers, can cache reads only
//! - Batch: For batch file operations, delays close
//! - Filter: For filter drivers, non-breaking level 2
//! - Read-Handle: shared read caching that also keeps the handle open
//!
//! The file system decides which locks to hold and how many conflicting
//! opens exist; the grant/break bookkeeping itself is behind
//! [`OplockFacility`]. The facility takes the request by value: it either
//! completes it before returning or keeps it pending until a break.
//!
//! # Break Notification Flow
//! 1. A granted request stays pending inside the [`Oplock`]
//! 2. A conflicting operation calls [`FsRtlOplockPackage::break_oplock`]
//! 3. The pending request is completed with `FILE_OPLOCK_BROKEN_TO_*`
//! 4. The holder flushes and acknowledges with one of the ack codes
//! 5. Requests waiting on `FSCTL_OPLOCK_BREAK_NOTIFY` are completed

use alloc::vec::Vec;
use spin::Mutex;

use crate::io::irp::Irp;
use crate::status::NtStatus;

/// FSCTL codes for oplock operations
pub mod fsctl_oplock {
    /// Request a Level 1 oplock
    pub const FSCTL_REQUEST_OPLOCK_LEVEL_1: u32 = 0x0009_0000;
    /// Request a Level 2 oplock
    pub const FSCTL_REQUEST_OPLOCK_LEVEL_2: u32 = 0x0009_0004;
    /// Request a Batch oplock
    pub const FSCTL_REQUEST_BATCH_OPLOCK: u32 = 0x0009_0008;
    /// Acknowledge an oplock break
    pub const FSCTL_OPLOCK_BREAK_ACKNOWLEDGE: u32 = 0x0009_000C;
    /// Close pending (Batch oplock)
    pub const FSCTL_OPBATCH_ACK_CLOSE_PENDING: u32 = 0x0009_0010;
    /// Notify when oplock break occurs
    pub const FSCTL_OPLOCK_BREAK_NOTIFY: u32 = 0x0009_0014;
    /// Acknowledge break to no oplock
    pub const FSCTL_OPLOCK_BREAK_ACK_NO_2: u32 = 0x0009_0050;
    /// Request a Filter oplock
    pub const FSCTL_REQUEST_FILTER_OPLOCK: u32 = 0x0009_005C;
    /// Generic request/acknowledge carrying a `REQUEST_OPLOCK_INPUT_BUFFER`
    pub const FSCTL_REQUEST_OPLOCK: u32 = 0x0009_0240;
}

/// Caching levels of a generic oplock request (OPLOCK_LEVEL_CACHE_*)
pub mod oplock_level {
    pub const OPLOCK_LEVEL_CACHE_READ: u32 = 0x0000_0001;
    pub const OPLOCK_LEVEL_CACHE_HANDLE: u32 = 0x0000_0002;
    pub const OPLOCK_LEVEL_CACHE_WRITE: u32 = 0x0000_0004;
}

/// Flags of a generic oplock request (REQUEST_OPLOCK_INPUT_FLAG_*)
pub mod request_flags {
    pub const REQUEST_OPLOCK_INPUT_FLAG_REQUEST: u32 = 0x0000_0001;
    pub const REQUEST_OPLOCK_INPUT_FLAG_ACK: u32 = 0x0000_0002;
    pub const REQUEST_OPLOCK_INPUT_FLAG_COMPLETE_ACK_ON_CLOSE: u32 = 0x0000_0004;
}

/// FILE_OPLOCK_BROKEN_TO_* constants for IoStatusBlock.Information
pub mod oplock_break_info {
    /// Oplock broken to Level 2
    pub const FILE_OPLOCK_BROKEN_TO_LEVEL_2: usize = 0x0000_0007;
    /// Oplock broken to None
    pub const FILE_OPLOCK_BROKEN_TO_NONE: usize = 0x0000_0008;
}

/// Size of `REQUEST_OPLOCK_INPUT_BUFFER`
pub const REQUEST_OPLOCK_INPUT_BUFFER_SIZE: usize = 12;

/// Size of `REQUEST_OPLOCK_OUTPUT_BUFFER`
pub const REQUEST_OPLOCK_OUTPUT_BUFFER_SIZE: u32 = 24;

pub const REQUEST_OPLOCK_CURRENT_VERSION: u16 = 1;

/// Decoded `REQUEST_OPLOCK_INPUT_BUFFER`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestOplockInput {
    pub version: u16,
    pub length: u16,
    pub requested_level: u32,
    pub flags: u32,
}

impl RequestOplockInput {
    pub const fn new(requested_level: u32, flags: u32) -> Self {
        Self {
            version: REQUEST_OPLOCK_CURRENT_VERSION,
            length: REQUEST_OPLOCK_INPUT_BUFFER_SIZE as u16,
            requested_level,
            flags,
        }
    }

    /// Decode the little-endian wire layout
    pub fn parse(buffer: &[u8]) -> Result<Self, NtStatus> {
        if buffer.len() < REQUEST_OPLOCK_INPUT_BUFFER_SIZE {
            return Err(NtStatus::BufferTooSmall);
        }
        Ok(Self {
            version: u16::from_le_bytes([buffer[0], buffer[1]]),
            length: u16::from_le_bytes([buffer[2], buffer[3]]),
            requested_level: u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            flags: u32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_OPLOCK_INPUT_BUFFER_SIZE] {
        let mut bytes = [0u8; REQUEST_OPLOCK_INPUT_BUFFER_SIZE];
        bytes[0..2].copy_from_slice(&self.version.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.requested_level.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.flags & request_flags::REQUEST_OPLOCK_INPUT_FLAG_REQUEST != 0
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.flags & request_flags::REQUEST_OPLOCK_INPUT_FLAG_ACK != 0
    }

    #[inline]
    pub fn wants_handle_caching(&self) -> bool {
        self.requested_level & oplock_level::OPLOCK_LEVEL_CACHE_HANDLE != 0
    }
}

/// Whether a request asks for a shared (read or read-handle) oplock.
///
/// `input` must be the decoded buffer when `code` is `FSCTL_REQUEST_OPLOCK`.
pub fn is_shared_request(code: u32, input: Option<&RequestOplockInput>) -> bool {
    match code {
        fsctl_oplock::FSCTL_REQUEST_OPLOCK_LEVEL_2 => true,
        fsctl_oplock::FSCTL_REQUEST_OPLOCK => input.is_some_and(|input| {
            input.is_request()
                && input.requested_level & oplock_level::OPLOCK_LEVEL_CACHE_WRITE == 0
        }),
        _ => false,
    }
}

/// Oplock types
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplockType {
    /// No oplock held
    None = 0,
    /// Level 1 - exclusive, can cache reads and writes
    Level1 = 1,
    /// Batch oplock - exclusive with delayed close
    Batch = 2,
    /// Filter oplock - non-breaking shared read
    Filter = 3,
    /// Level 2 - shared, can cache reads
    Level2 = 4,
    /// Read-Handle - shared, can cache reads and keep the handle
    ReadHandle = 5,
}

impl OplockType {
    /// Type granted for a generic request of `level`
    pub fn from_level(level: u32) -> Self {
        use oplock_level::*;
        let write = level & OPLOCK_LEVEL_CACHE_WRITE != 0;
        let handle = level & OPLOCK_LEVEL_CACHE_HANDLE != 0;
        match (level & OPLOCK_LEVEL_CACHE_READ != 0, write, handle) {
            (false, _, _) => OplockType::None,
            (true, true, true) => OplockType::Batch,
            (true, true, false) => OplockType::Level1,
            (true, false, true) => OplockType::ReadHandle,
            (true, false, false) => OplockType::Level2,
        }
    }

    #[inline]
    pub fn is_exclusive(self) -> bool {
        matches!(self, OplockType::Level1 | OplockType::Batch | OplockType::Filter)
    }

    #[inline]
    pub fn is_shared(self) -> bool {
        matches!(self, OplockType::Level2 | OplockType::ReadHandle)
    }
}

/// Oplock break status
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplockBreakStatus {
    /// No break in progress
    None = 0,
    /// Breaking to Level 2
    ToLevel2 = 1,
    /// Breaking to None
    ToNone = 2,
}

/// Request types that can break an oplock
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplockBreakRequest {
    /// Read request
    Read = 0,
    /// Write request
    Write = 1,
    /// Handle create with write access
    HandleCreate = 2,
    /// Lock request
    Lock = 3,
    /// Close handle (for batch)
    Close = 4,
}

/// Oplock flags
pub mod oplock_flags {
    /// Pending oplock break
    pub const OPLOCK_FLAG_BREAK_IN_PROGRESS: u32 = 0x0001;
    /// Pending close for batch oplock
    pub const OPLOCK_FLAG_CLOSE_PENDING: u32 = 0x0020;
}

struct SharedHolder {
    owner: u64,
    irp: Irp,
}

struct OplockState {
    oplock_type: OplockType,
    flags: u32,
    /// File object holding the exclusive oplock
    exclusive_owner: u64,
    /// Pending grant of the exclusive holder, completed on break
    exclusive_irp: Option<Irp>,
    break_status: OplockBreakStatus,
    /// Shared holders with their pending grants
    shared: Vec<SharedHolder>,
    /// FSCTL_OPLOCK_BREAK_NOTIFY requests waiting for the break to finish
    notify_waiters: Vec<Irp>,
}

impl OplockState {
    const fn new() -> Self {
        Self {
            oplock_type: OplockType::None,
            flags: 0,
            exclusive_owner: 0,
            exclusive_irp: None,
            break_status: OplockBreakStatus::None,
            shared: Vec::new(),
            notify_waiters: Vec::new(),
        }
    }

    fn is_break_in_progress(&self) -> bool {
        self.flags & oplock_flags::OPLOCK_FLAG_BREAK_IN_PROGRESS != 0
    }

    /// Clear the break and hand back the notify waiters. They are
    /// completed once the state lock is released.
    #[must_use]
    fn finish_break(&mut self) -> Vec<Irp> {
        self.flags &= !oplock_flags::OPLOCK_FLAG_BREAK_IN_PROGRESS;
        self.break_status = OplockBreakStatus::None;
        core::mem::take(&mut self.notify_waiters)
    }
}

/// Per-file oplock state
pub struct Oplock {
    state: Mutex<OplockState>,
}

impl Oplock {
    /// Create a new empty oplock structure
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(OplockState::new()),
        }
    }

    /// Get current oplock type
    pub fn oplock_type(&self) -> OplockType {
        self.state.lock().oplock_type
    }

    /// Check if an oplock is held
    pub fn is_oplock_held(&self) -> bool {
        self.oplock_type() != OplockType::None
    }

    /// Check if a break is in progress
    pub fn is_break_in_progress(&self) -> bool {
        self.state.lock().is_break_in_progress()
    }

    /// Get break status
    pub fn break_status(&self) -> OplockBreakStatus {
        self.state.lock().break_status
    }

    /// Number of shared holders
    pub fn shared_count(&self) -> usize {
        self.state.lock().shared.len()
    }

    /// Whether fast I/O may bypass oplock checks
    pub fn is_fast_io_possible(&self) -> bool {
        let state = self.state.lock();
        !state.is_break_in_progress()
            && matches!(state.oplock_type, OplockType::None | OplockType::Level2)
    }
}

impl Default for Oplock {
    fn default() -> Self {
        Self::new()
    }
}

/// Grant/acknowledge bookkeeping for oplock FSCTLs.
///
/// Ownership of `irp` moves into the facility: it completes the request
/// itself, now or later.
pub trait OplockFacility: Send + Sync {
    fn oplock_fsctrl(&self, oplock: &Oplock, irp: Irp, open_count: u32) -> NtStatus;
}

/// Oplock statistics for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct OplockStats {
    pub total_granted: u64,
    pub exclusive_granted: u64,
    pub shared_granted: u64,
    pub not_granted: u64,
    pub total_breaks: u64,
    pub breaks_to_level2: u64,
    pub breaks_to_none: u64,
    pub break_acks: u64,
}

/// Default oplock package
#[derive(Default)]
pub struct FsRtlOplockPackage {
    stats: Mutex<OplockStats>,
}

impl FsRtlOplockPackage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current oplock statistics
    pub fn stats(&self) -> OplockStats {
        *self.stats.lock()
    }

    fn update_stats<F: FnOnce(&mut OplockStats)>(&self, f: F) {
        let mut stats = self.stats.lock();
        f(&mut stats);
    }

    /// Try to grant `requested` to `owner`. On success the request is kept
    /// pending in the oplock; otherwise it is handed back.
    fn request_oplock(
        &self,
        oplock: &Oplock,
        irp: Irp,
        owner: u64,
        requested: OplockType,
        open_count: u32,
    ) -> NtStatus {
        let mut state = oplock.state.lock();

        let granted = if state.is_break_in_progress() {
            false
        } else if requested.is_exclusive() {
            // Exclusive oplocks require a single opener and no existing oplock
            open_count == 1 && state.oplock_type == OplockType::None
        } else if requested.is_shared() {
            // A nonzero count means byte-range locks deny the shared oplock
            open_count == 0
                && (state.oplock_type == OplockType::None || state.oplock_type == requested)
        } else {
            false
        };

        if !granted {
            drop(state);
            self.update_stats(|s| s.not_granted += 1);
            log::debug!("[OPLOCK] {:?} not granted to file object {}", requested, owner);
            irp.complete(NtStatus::OplockNotGranted, 0);
            return NtStatus::OplockNotGranted;
        }

        state.oplock_type = requested;
        if requested.is_exclusive() {
            state.exclusive_owner = owner;
            state.exclusive_irp = Some(irp);
            self.update_stats(|s| {
                s.total_granted += 1;
                s.exclusive_granted += 1;
            });
        } else {
            state.shared.push(SharedHolder { owner, irp });
            self.update_stats(|s| {
                s.total_granted += 1;
                s.shared_granted += 1;
            });
        }
        log::debug!("[OPLOCK] {:?} granted to file object {}", requested, owner);
        NtStatus::Pending
    }

    fn acknowledge(&self, oplock: &Oplock, irp: Irp, owner: u64, new_level: OplockType) -> NtStatus {
        let mut state = oplock.state.lock();

        let valid = state.is_break_in_progress()
            && state.exclusive_owner == owner
            && match state.break_status {
                OplockBreakStatus::ToNone => new_level == OplockType::None,
                OplockBreakStatus::ToLevel2 => {
                    matches!(new_level, OplockType::Level2 | OplockType::None)
                }
                OplockBreakStatus::None => false,
            };

        if !valid {
            drop(state);
            irp.complete(NtStatus::InvalidOplockProtocol, 0);
            return NtStatus::InvalidOplockProtocol;
        }

        state.exclusive_owner = 0;
        if new_level == OplockType::Level2 {
            // The acknowledging request becomes the level 2 grant
            state.oplock_type = OplockType::Level2;
            state.shared.push(SharedHolder { owner, irp });
            let waiters = state.finish_break();
            drop(state);
            self.update_stats(|s| s.break_acks += 1);
            complete_all(waiters, NtStatus::Success, 0);
            return NtStatus::Pending;
        }

        state.oplock_type = OplockType::None;
        let waiters = state.finish_break();
        drop(state);
        self.update_stats(|s| s.break_acks += 1);
        complete_all(waiters, NtStatus::Success, 0);
        irp.complete(NtStatus::Success, 0);
        NtStatus::Success
    }

    /// Break any oplock that `request` by `requester` conflicts with.
    ///
    /// Pending grants are completed with the level they are broken to.
    pub fn break_oplock(
        &self,
        oplock: &Oplock,
        requester: u64,
        request: OplockBreakRequest,
    ) -> OplockBreakStatus {
        let mut state = oplock.state.lock();

        let break_to = match (state.oplock_type, request) {
            (OplockType::None, _) | (OplockType::Filter, _) => OplockBreakStatus::None,
            (kind, _) if kind.is_exclusive() && state.exclusive_owner == requester => {
                OplockBreakStatus::None
            }
            (OplockType::Level1 | OplockType::Batch, OplockBreakRequest::Read) => {
                OplockBreakStatus::ToLevel2
            }
            (OplockType::Level1, OplockBreakRequest::Close) => OplockBreakStatus::None,
            (OplockType::Level1 | OplockType::Batch, _) => OplockBreakStatus::ToNone,
            (
                OplockType::Level2 | OplockType::ReadHandle,
                OplockBreakRequest::Write | OplockBreakRequest::Lock,
            ) => OplockBreakStatus::ToNone,
            (OplockType::ReadHandle, OplockBreakRequest::HandleCreate) => OplockBreakStatus::ToLevel2,
            _ => OplockBreakStatus::None,
        };

        if break_to == OplockBreakStatus::None || state.is_break_in_progress() {
            return if state.is_break_in_progress() {
                state.break_status
            } else {
                OplockBreakStatus::None
            };
        }

        let info = match break_to {
            OplockBreakStatus::ToLevel2 => oplock_break_info::FILE_OPLOCK_BROKEN_TO_LEVEL_2,
            _ => oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE,
        };

        // Completion routines may call back into this oplock
        let mut broken = Vec::new();
        if state.oplock_type.is_exclusive() {
            state.flags |= oplock_flags::OPLOCK_FLAG_BREAK_IN_PROGRESS;
            state.break_status = break_to;
            broken.extend(state.exclusive_irp.take());
        } else {
            // Shared holders are not acknowledged; they simply lose the oplock
            // or, for read-handle, drop to level 2 in place
            if break_to == OplockBreakStatus::ToNone {
                for holder in state.shared.drain(..) {
                    log::trace!("[OPLOCK] breaking shared holder {}", holder.owner);
                    broken.push(holder.irp);
                }
                state.oplock_type = OplockType::None;
            } else {
                state.oplock_type = OplockType::Level2;
            }
        }

        drop(state);
        complete_all(broken, NtStatus::Success, info);
        self.update_stats(|s| {
            s.total_breaks += 1;
            match break_to {
                OplockBreakStatus::ToLevel2 => s.breaks_to_level2 += 1,
                _ => s.breaks_to_none += 1,
            }
        });
        log::debug!("[OPLOCK] break {:?} for request {:?}", break_to, request);
        break_to
    }
}

fn complete_all(irps: Vec<Irp>, status: NtStatus, information: usize) {
    for irp in irps {
        irp.complete(status, information);
    }
}

impl OplockFacility for FsRtlOplockPackage {
    fn oplock_fsctrl(&self, oplock: &Oplock, irp: Irp, open_count: u32) -> NtStatus {
        use fsctl_oplock::*;

        let owner = irp.file_object_id();

        match irp.fs_control_code {
            FSCTL_REQUEST_OPLOCK_LEVEL_1 => {
                self.request_oplock(oplock, irp, owner, OplockType::Level1, open_count)
            }
            FSCTL_REQUEST_BATCH_OPLOCK => {
                self.request_oplock(oplock, irp, owner, OplockType::Batch, open_count)
            }
            FSCTL_REQUEST_FILTER_OPLOCK => {
                self.request_oplock(oplock, irp, owner, OplockType::Filter, open_count)
            }
            FSCTL_REQUEST_OPLOCK_LEVEL_2 => {
                self.request_oplock(oplock, irp, owner, OplockType::Level2, open_count)
            }
            FSCTL_REQUEST_OPLOCK => {
                let input = match RequestOplockInput::parse(&irp.input_buffer) {
                    Ok(input) => input,
                    Err(status) => {
                        irp.complete(status, 0);
                        return status;
                    }
                };
                let level = OplockType::from_level(input.requested_level);
                if input.is_ack() {
                    self.acknowledge(oplock, irp, owner, level)
                } else {
                    self.request_oplock(oplock, irp, owner, level, open_count)
                }
            }
            FSCTL_OPLOCK_BREAK_ACKNOWLEDGE => {
                self.acknowledge(oplock, irp, owner, OplockType::Level2)
            }
            FSCTL_OPLOCK_BREAK_ACK_NO_2 => self.acknowledge(oplock, irp, owner, OplockType::None),
            FSCTL_OPBATCH_ACK_CLOSE_PENDING => {
                let mut state = oplock.state.lock();
                if state.oplock_type == OplockType::Batch && state.exclusive_owner == owner {
                    state.flags |= oplock_flags::OPLOCK_FLAG_CLOSE_PENDING;
                }
                drop(state);
                irp.complete(NtStatus::Success, 0);
                NtStatus::Success
            }
            FSCTL_OPLOCK_BREAK_NOTIFY => {
                let mut state = oplock.state.lock();
                if state.is_break_in_progress() {
                    state.notify_waiters.push(irp);
                    NtStatus::Pending
                } else {
                    drop(state);
                    irp.complete(NtStatus::Success, 0);
                    NtStatus::Success
                }
            }
            _ => {
                irp.complete(NtStatus::InvalidOplockProtocol, 0);
                NtStatus::InvalidOplockProtocol
            }
        }
    }
}
