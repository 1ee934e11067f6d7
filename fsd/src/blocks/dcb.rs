//! Device Control Block
//!
//! One per disk device registered by user mode. Holds the device's start
//! parameters, its resource, the forward link to the volume mounted on it
//! and the liveness state watched by the check thread.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

use super::{NodeIdentifier, NodeType, Vcb};
use crate::config::{DcbParameters, MountOptions};
use crate::ex::{BackgroundTask, EResource};
use crate::global::MountKey;

pub struct Dcb {
    identifier: NodeIdentifier,
    params: DcbParameters,
    /// Protects the mount entry and the liveness deadline
    pub resource: EResource,
    /// Volume currently mounted on this device
    vcb: RwLock<Option<Arc<Vcb>>>,
    /// Absolute time (ms) after which the session is considered dead
    tick_deadline_ms: AtomicU64,
    liveness: BackgroundTask,
}

impl Dcb {
    pub fn new(params: DcbParameters) -> Arc<Self> {
        Arc::new(Self {
            identifier: NodeIdentifier::of::<Dcb>(NodeType::Dcb),
            params,
            resource: EResource::new(),
            vcb: RwLock::new(None),
            tick_deadline_ms: AtomicU64::new(0),
            liveness: BackgroundTask::new("DokanCheckThread"),
        })
    }

    #[inline]
    pub fn identifier(&self) -> NodeIdentifier {
        self.identifier
    }

    pub fn params(&self) -> &DcbParameters {
        &self.params
    }

    pub fn mount_point(&self) -> &str {
        &self.params.mount_point
    }

    pub fn disk_device_name(&self) -> &str {
        &self.params.disk_device_name
    }

    pub fn mount_options(&self) -> MountOptions {
        self.params.mount_options
    }

    pub fn is_network(&self) -> bool {
        self.params.is_network()
    }

    /// Key of this device's entry in the mount table
    pub fn mount_key(&self) -> MountKey {
        MountKey::new(
            &self.params.disk_device_name,
            &self.params.unc_name,
            self.params.session_id,
        )
    }

    pub fn vcb(&self) -> Option<Arc<Vcb>> {
        self.vcb.read().clone()
    }

    pub(crate) fn set_vcb(&self, vcb: Arc<Vcb>) {
        *self.vcb.write() = Some(vcb);
    }

    /// Push the liveness deadline to `now_ms + timeout_ms`.
    /// Callers hold `resource` exclusive.
    pub fn update_timeout(&self, now_ms: u64, timeout_ms: u64) {
        debug_assert!(self.resource.is_acquired_exclusive());
        self.tick_deadline_ms
            .store(now_ms.saturating_add(timeout_ms), Ordering::Release);
    }

    pub fn tick_deadline_ms(&self) -> u64 {
        self.tick_deadline_ms.load(Ordering::Acquire)
    }

    /// The liveness check thread slot
    pub fn liveness(&self) -> &BackgroundTask {
        &self.liveness
    }
}

impl core::fmt::Debug for Dcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dcb")
            .field("mount_point", &self.params.mount_point)
            .field("disk_device_name", &self.params.disk_device_name)
            .field("liveness", &self.liveness)
            .finish()
    }
}
