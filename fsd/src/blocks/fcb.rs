//! File Control Block
//!
//! One per open path on a volume, shared by every handle to that path.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use super::{BlockRef, ControlBlock, NodeIdentifier, NodeType, OplockDebugInfo, Vcb};
use crate::ex::EResource;
use crate::fsrtl::filelock::FileLock;
use crate::fsrtl::oplock::Oplock;
use crate::status::NtStatus;

/// FCB state flags
pub mod fcb_flags {
    pub const DOKAN_FILE_DIRECTORY: u32 = 0x0000_0001;
    pub const DOKAN_DELETE_ON_CLOSE: u32 = 0x0000_0002;
}

pub struct Fcb {
    identifier: NodeIdentifier,
    vcb: BlockRef,
    file_name: String,
    pub resource: EResource,
    flags: AtomicU32,
    is_keepalive: AtomicBool,
    /// Open handles on this path
    file_count: AtomicU32,
    allocation_size: AtomicI64,
    file_lock: FileLock,
    oplock: Oplock,
    oplock_debug: OplockDebugInfo,
}

impl Fcb {
    pub fn new(vcb: BlockRef, file_name: &str, is_directory: bool) -> Arc<Self> {
        let flags = if is_directory {
            fcb_flags::DOKAN_FILE_DIRECTORY
        } else {
            0
        };
        Arc::new(Self {
            identifier: NodeIdentifier::of::<Fcb>(NodeType::Fcb),
            vcb,
            file_name: String::from(file_name),
            resource: EResource::new(),
            flags: AtomicU32::new(flags),
            is_keepalive: AtomicBool::new(false),
            file_count: AtomicU32::new(0),
            allocation_size: AtomicI64::new(0),
            file_lock: FileLock::new(),
            oplock: Oplock::new(),
            oplock_debug: OplockDebugInfo::new(),
        })
    }

    #[inline]
    pub fn identifier(&self) -> NodeIdentifier {
        self.identifier
    }

    /// Volume this file lives on; the volume must still be mounted
    pub fn vcb(&self) -> Result<Arc<Vcb>, NtStatus> {
        let vcb = self.vcb.resolve(NodeType::Vcb, ControlBlock::as_vcb)?;
        if !vcb.is_mounted() {
            log::debug!("[FCB] {} belongs to an unmounted volume", self.file_name);
            return Err(NtStatus::InvalidParameter);
        }
        Ok(vcb)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.flags() & fcb_flags::DOKAN_FILE_DIRECTORY != 0
    }

    #[inline]
    pub fn is_delete_on_close(&self) -> bool {
        self.flags() & fcb_flags::DOKAN_DELETE_ON_CLOSE != 0
    }

    pub fn set_delete_on_close(&self, delete: bool) {
        if delete {
            self.flags.fetch_or(fcb_flags::DOKAN_DELETE_ON_CLOSE, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!fcb_flags::DOKAN_DELETE_ON_CLOSE, Ordering::AcqRel);
        }
    }

    /// Whether handles to this file may be activated as the keepalive
    pub fn is_keepalive(&self) -> bool {
        self.is_keepalive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_keepalive(&self) {
        self.is_keepalive.store(true, Ordering::Release);
    }

    #[inline]
    pub fn file_count(&self) -> u32 {
        self.file_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_file_count(&self) -> u32 {
        self.file_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the remaining count, or `None` if no handle was open
    pub(crate) fn decrement_file_count(&self) -> Option<u32> {
        self.file_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }

    pub fn allocation_size(&self) -> i64 {
        self.allocation_size.load(Ordering::Acquire)
    }

    pub fn set_allocation_size(&self, size: i64) {
        self.allocation_size.store(size, Ordering::Release);
    }

    pub fn file_lock(&self) -> &FileLock {
        &self.file_lock
    }

    pub fn oplock(&self) -> &Oplock {
        &self.oplock
    }

    pub fn oplock_debug(&self) -> &OplockDebugInfo {
        &self.oplock_debug
    }
}

impl core::fmt::Debug for Fcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fcb")
            .field("file_name", &self.file_name)
            .field("flags", &format_args!("0x{:08X}", self.flags()))
            .field("file_count", &self.file_count())
            .finish()
    }
}
