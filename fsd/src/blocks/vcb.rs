//! Volume Control Block
//!
//! One per mounted volume; it is the extension of the volume device created
//! at mount time. It owns the list of open FCBs and the directory notify
//! list. The VCB is only usable while `VCB_MOUNTED` is set.
//!
//! Released FCBs are either dropped from the list at once or, when a
//! garbage-collection interval is configured, parked on the garbage list
//! and dropped by the collector once they have aged out.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use super::{BlockRef, ControlBlock, Dcb, Fcb, NodeIdentifier, NodeType};
use crate::ex::{AcquireMode, BackgroundTask, EResource};
use crate::fsrtl::notify::{DirNotifyList, NotifySync};
use crate::io::device::DeviceObject;
use crate::status::NtStatus;

/// VCB state flags
pub mod vcb_flags {
    pub const VCB_MOUNTED: u32 = 0x0000_0004;
}

/// Name of the file whose handle acts as the session keepalive
pub const KEEPALIVE_FILE_NAME: &str = "\\__drive_fs_keepalive";

struct GarbageFcb {
    fcb: Arc<Fcb>,
    released_at_ms: u64,
}

pub struct Vcb {
    identifier: NodeIdentifier,
    dcb: BlockRef,
    device: Weak<DeviceObject>,
    pub resource: EResource,
    flags: AtomicU32,
    keepalive_active: AtomicBool,
    fcbs: Mutex<Vec<Arc<Fcb>>>,
    notify_sync: NotifySync,
    dir_notify_list: DirNotifyList,
    fcb_gc_interval_ms: u64,
    garbage: Mutex<Vec<GarbageFcb>>,
    gc: BackgroundTask,
}

impl Vcb {
    pub fn new(dcb: BlockRef, device: &Arc<DeviceObject>, fcb_gc_interval_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            identifier: NodeIdentifier::of::<Vcb>(NodeType::Vcb),
            dcb,
            device: Arc::downgrade(device),
            resource: EResource::new(),
            flags: AtomicU32::new(0),
            keepalive_active: AtomicBool::new(false),
            fcbs: Mutex::new(Vec::new()),
            notify_sync: NotifySync::new(),
            dir_notify_list: DirNotifyList::new(),
            fcb_gc_interval_ms,
            garbage: Mutex::new(Vec::new()),
            gc: BackgroundTask::new("DokanFcbGarbageCollector"),
        })
    }

    #[inline]
    pub fn identifier(&self) -> NodeIdentifier {
        self.identifier
    }

    /// Owning DCB
    pub fn dcb(&self) -> Result<Arc<Dcb>, NtStatus> {
        self.dcb.resolve(NodeType::Dcb, ControlBlock::as_dcb)
    }

    /// Volume device this VCB extends
    pub fn device(&self) -> Option<Arc<DeviceObject>> {
        self.device.upgrade()
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_mounted(&self) -> bool {
        self.flags() & vcb_flags::VCB_MOUNTED != 0
    }

    pub fn is_keepalive_active(&self) -> bool {
        self.keepalive_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_keepalive_active(&self) {
        self.keepalive_active.store(true, Ordering::Release);
    }

    pub fn notify_sync(&self) -> &NotifySync {
        &self.notify_sync
    }

    pub fn dir_notify_list(&self) -> &DirNotifyList {
        &self.dir_notify_list
    }

    pub fn fcb_gc_interval_ms(&self) -> u64 {
        self.fcb_gc_interval_ms
    }

    /// The FCB garbage collector slot
    pub fn gc(&self) -> &BackgroundTask {
        &self.gc
    }

    /// Find or create the FCB for `name` and count one more open handle on it
    pub fn open_fcb(self: &Arc<Self>, name: &str, is_directory: bool) -> Arc<Fcb> {
        let _vcb = self.resource.acquire(AcquireMode::Exclusive);
        let mut fcbs = self.fcbs.lock();

        let fcb = match fcbs.iter().find(|fcb| fcb.file_name() == name) {
            Some(fcb) => {
                // Reopened before the collector got to it
                self.garbage
                    .lock()
                    .retain(|entry| !Arc::ptr_eq(&entry.fcb, fcb));
                Arc::clone(fcb)
            }
            None => {
                let fcb = Fcb::new(BlockRef::from(self), name, is_directory);
                if name == KEEPALIVE_FILE_NAME {
                    fcb.mark_keepalive();
                }
                log::trace!("[VCB] new FCB {}", name);
                fcbs.push(Arc::clone(&fcb));
                fcb
            }
        };

        fcb.increment_file_count();
        fcb
    }

    /// Count one handle on `fcb` as closed; the last close frees or parks it
    pub fn release_fcb(&self, fcb: &Arc<Fcb>, now_ms: u64) {
        let _vcb = self.resource.acquire(AcquireMode::Exclusive);
        match fcb.decrement_file_count() {
            Some(0) => {}
            Some(_) => return,
            None => {
                log::warn!("[VCB] release of FCB {} with no open handle", fcb.file_name());
                return;
            }
        }

        if self.fcb_gc_interval_ms == 0 {
            self.fcbs.lock().retain(|entry| !Arc::ptr_eq(entry, fcb));
            log::trace!("[VCB] freed FCB {}", fcb.file_name());
        } else {
            self.garbage.lock().push(GarbageFcb {
                fcb: Arc::clone(fcb),
                released_at_ms: now_ms,
            });
        }
    }

    /// Drop parked FCBs older than the collection interval. Returns how
    /// many were freed.
    pub fn collect_garbage(&self, now_ms: u64) -> usize {
        let _vcb = self.resource.acquire(AcquireMode::Exclusive);
        let mut fcbs = self.fcbs.lock();
        let mut garbage = self.garbage.lock();
        let interval = self.fcb_gc_interval_ms;
        let mut freed = 0;

        garbage.retain(|entry| {
            if entry.fcb.file_count() > 0 {
                return false;
            }
            if now_ms.saturating_sub(entry.released_at_ms) < interval {
                return true;
            }
            fcbs.retain(|fcb| !Arc::ptr_eq(fcb, &entry.fcb));
            freed += 1;
            false
        });

        if freed > 0 {
            log::debug!("[VCB] garbage collector freed {} FCB(s)", freed);
        }
        freed
    }

    pub fn fcb_count(&self) -> usize {
        self.fcbs.lock().len()
    }

    pub fn garbage_count(&self) -> usize {
        self.garbage.lock().len()
    }

    /// Names of all FCBs on the volume
    pub fn fcb_names(&self) -> Vec<String> {
        self.fcbs
            .lock()
            .iter()
            .map(|fcb| String::from(fcb.file_name()))
            .collect()
    }
}

impl core::fmt::Debug for Vcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcb")
            .field("flags", &format_args!("0x{:08X}", self.flags()))
            .field("keepalive_active", &self.is_keepalive_active())
            .field("fcbs", &self.fcb_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    #[test]
    fn test_open_shares_fcb_per_path() {
        let fixture = Fixture::mounted();
        let first = fixture.vcb.open_fcb("\\dir\\a.txt", false);
        let second = fixture.vcb.open_fcb("\\dir\\a.txt", false);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.file_count(), 2);
        assert_eq!(fixture.vcb.fcb_count(), 1);
        assert!(!fixture.vcb.resource.is_acquired());
    }

    #[test]
    fn test_release_without_gc_frees_immediately() {
        let fixture = Fixture::mounted();
        let fcb = fixture.vcb.open_fcb("\\a", false);
        fixture.vcb.release_fcb(&fcb, 0);
        assert_eq!(fixture.vcb.fcb_count(), 0);
    }

    #[test]
    fn test_garbage_collection_ages_out() {
        let fixture = Fixture::mounted_with_gc(2_000);
        let parked = fixture.vcb.open_fcb("\\parked", false);
        let reopened = fixture.vcb.open_fcb("\\reopened", false);

        fixture.vcb.release_fcb(&parked, 1_000);
        fixture.vcb.release_fcb(&reopened, 1_000);
        assert_eq!(fixture.vcb.garbage_count(), 2);

        // Reopening takes the FCB off the garbage list
        fixture.vcb.open_fcb("\\reopened", false);
        assert_eq!(fixture.vcb.garbage_count(), 1);

        assert_eq!(fixture.vcb.collect_garbage(2_500), 0);
        assert_eq!(fixture.vcb.collect_garbage(3_000), 1);
        assert_eq!(fixture.vcb.fcb_names(), ["\\reopened"]);
    }

    #[test]
    fn test_unbalanced_release_parks_once() {
        let fixture = Fixture::mounted_with_gc(2_000);
        let fcb = fixture.vcb.open_fcb("\\once", false);

        fixture.vcb.release_fcb(&fcb, 1_000);
        fixture.vcb.release_fcb(&fcb, 1_500);
        assert_eq!(fcb.file_count(), 0);
        assert_eq!(fixture.vcb.garbage_count(), 1);

        assert_eq!(fixture.vcb.collect_garbage(3_000), 1);
        assert_eq!(fixture.vcb.fcb_count(), 0);
    }

    #[test]
    fn test_keepalive_file_is_marked() {
        let fixture = Fixture::mounted();
        assert!(fixture.vcb.open_fcb(KEEPALIVE_FILE_NAME, false).is_keepalive());
        assert!(!fixture.vcb.open_fcb("\\other", false).is_keepalive());
    }
}
