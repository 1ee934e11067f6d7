//! Context Control Block: per-handle state

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{ControlBlock, Fcb, NodeIdentifier, NodeType};
use crate::status::NtStatus;

pub struct Ccb {
    identifier: NodeIdentifier,
    fcb: ControlBlock,
    keepalive_active: AtomicBool,
}

impl Ccb {
    pub fn new(fcb: ControlBlock) -> Arc<Self> {
        Arc::new(Self {
            identifier: NodeIdentifier::of::<Ccb>(NodeType::Ccb),
            fcb,
            keepalive_active: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn identifier(&self) -> NodeIdentifier {
        self.identifier
    }

    /// The FCB this handle is open on
    pub fn fcb(&self) -> Result<Arc<Fcb>, NtStatus> {
        self.fcb.as_fcb()
    }

    pub fn is_keepalive_active(&self) -> bool {
        self.keepalive_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_keepalive_active(&self) {
        self.keepalive_active.store(true, Ordering::Release);
    }
}

impl core::fmt::Debug for Ccb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ccb")
            .field("fcb", &self.fcb)
            .field("keepalive_active", &self.is_keepalive_active())
            .finish()
    }
}
