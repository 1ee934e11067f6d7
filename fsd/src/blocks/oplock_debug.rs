//! Per-FCB oplock debug ring
//!
//! A fixed-size record of the most recent oplock-related events on a file.
//! It is always written, independent of log settings, so a hung oplock can
//! be diagnosed after the fact from the FCB alone.

use alloc::vec::Vec;
use spin::Mutex;

/// Number of events kept per FCB
pub const OPLOCK_DEBUG_SLOTS: usize = 32;

/// Flags recorded with [`OplockDebugInfo::record_flag`]
pub mod oplock_debug_flags {
    /// A generic FSCTL_REQUEST_OPLOCK carried the ACK flag
    pub const DOKAN_OPLOCK_DEBUG_GENERIC_ACKNOWLEDGEMENT: u32 = 0x0000_0001;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplockDebugEvent {
    /// A request of this major function reached the FCB
    MajorFunction(u8),
    /// An oplock FSCTL with its requested level (zero for fixed-level codes)
    Request { code: u32, level: u32 },
    Flag(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OplockDebugRecord {
    /// Position of this event in the FCB's history, starting at 0
    pub sequence: u64,
    pub event: OplockDebugEvent,
}

struct Ring {
    slots: [Option<OplockDebugRecord>; OPLOCK_DEBUG_SLOTS],
    next_sequence: u64,
    /// Union of every flag recorded
    flags: u32,
}

pub struct OplockDebugInfo {
    ring: Mutex<Ring>,
}

impl OplockDebugInfo {
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: [None; OPLOCK_DEBUG_SLOTS],
                next_sequence: 0,
                flags: 0,
            }),
        }
    }

    fn record(&self, event: OplockDebugEvent) {
        let mut ring = self.ring.lock();
        let sequence = ring.next_sequence;
        ring.slots[(sequence % OPLOCK_DEBUG_SLOTS as u64) as usize] =
            Some(OplockDebugRecord { sequence, event });
        ring.next_sequence += 1;
    }

    pub fn record_major_function(&self, major: u8) {
        self.record(OplockDebugEvent::MajorFunction(major));
    }

    pub fn record_request(&self, code: u32, level: u32) {
        self.record(OplockDebugEvent::Request { code, level });
    }

    pub fn record_flag(&self, flag: u32) {
        self.ring.lock().flags |= flag;
        self.record(OplockDebugEvent::Flag(flag));
    }

    /// Retained events, oldest first
    pub fn snapshot(&self) -> Vec<OplockDebugRecord> {
        let ring = self.ring.lock();
        let mut records: Vec<_> = ring.slots.iter().flatten().copied().collect();
        records.sort_by_key(|record| record.sequence);
        records
    }

    pub fn flags(&self) -> u32 {
        self.ring.lock().flags
    }

    /// Total events ever recorded
    pub fn total(&self) -> u64 {
        self.ring.lock().next_sequence
    }
}

impl Default for OplockDebugInfo {
    fn default() -> Self {
        Self::new()
    }
}
