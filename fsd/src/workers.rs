//! Volume background workers
//!
//! - FCB garbage collector: one per VCB when a collection interval is set.
//!   Periodically frees FCBs whose last handle was released long enough ago.
//! - Liveness checker: one per DCB. Once the session's deadline passes
//!   without an active keepalive handle, it asks the mount manager to
//!   unmount the device and exits.
//!
//! Both loops hold only weak references to their block, so a torn-down
//! block ends the loop instead of being kept alive by it.

use alloc::sync::Arc;
use core::ops::ControlFlow;

use crate::blocks::{Dcb, Vcb};
use crate::config::CHECK_INTERVAL_MS;
use crate::ex::{Clock, TaskHandle};
use crate::global::Collaborators;
use crate::mountmgr::MountManager;
use crate::status::NtStatus;

/// Outcome of one liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The deadline passed and no keepalive handle is active
    Expired,
}

/// Check the session of `dcb` against `now_ms`
pub fn check_liveness(dcb: &Dcb, now_ms: u64) -> Liveness {
    if dcb.tick_deadline_ms() >= now_ms {
        return Liveness::Alive;
    }
    match dcb.vcb() {
        Some(vcb) if vcb.is_keepalive_active() => Liveness::Alive,
        _ => Liveness::Expired,
    }
}

/// One liveness pass; breaks once the device has been unmounted
pub fn liveness_pass(dcb: &Dcb, now_ms: u64, mount_manager: &dyn MountManager) -> ControlFlow<NtStatus> {
    match check_liveness(dcb, now_ms) {
        Liveness::Alive => ControlFlow::Continue(()),
        Liveness::Expired => {
            log::warn!(
                "[MOUNT] session of {} timed out, unmounting",
                dcb.disk_device_name()
            );
            let status = mount_manager.unmount(dcb);
            if status.is_error() {
                log::error!("[MOUNT] unmount of {} failed: {}", dcb.disk_device_name(), status);
            }
            ControlFlow::Break(status)
        }
    }
}

/// One collection pass; breaks once the volume is no longer mounted
pub fn gc_pass(vcb: &Vcb, now_ms: u64) -> ControlFlow<()> {
    if !vcb.is_mounted() {
        return ControlFlow::Break(());
    }
    vcb.collect_garbage(now_ms);
    ControlFlow::Continue(())
}

/// Start the liveness checker of `dcb`
pub fn start_liveness_checker(dcb: &Arc<Dcb>, collab: &Collaborators) -> Result<bool, NtStatus> {
    let dcb_ref = Arc::downgrade(dcb);
    let clock = Arc::clone(&collab.clock);
    let mount_manager = Arc::clone(&collab.mount_manager);

    dcb.liveness().start(collab.threads.as_ref(), move |handle: TaskHandle| {
        log::debug!("[MOUNT] check thread start");
        while !handle.stop_requested() {
            clock.sleep_ms(CHECK_INTERVAL_MS);
            if handle.stop_requested() {
                break;
            }
            let Some(dcb) = dcb_ref.upgrade() else {
                break;
            };
            if liveness_pass(&dcb, clock.now_ms(), mount_manager.as_ref()).is_break() {
                break;
            }
        }
        log::debug!("[MOUNT] check thread stop");
    })
}

/// Start the FCB garbage collector of `vcb`
pub fn start_fcb_garbage_collector(vcb: &Arc<Vcb>, collab: &Collaborators) -> Result<bool, NtStatus> {
    let vcb_ref = Arc::downgrade(vcb);
    let clock: Arc<dyn Clock> = Arc::clone(&collab.clock);
    let interval = vcb.fcb_gc_interval_ms();

    vcb.gc().start(collab.threads.as_ref(), move |handle: TaskHandle| {
        while !handle.stop_requested() {
            clock.sleep_ms(interval);
            if handle.stop_requested() {
                break;
            }
            let Some(vcb) = vcb_ref.upgrade() else {
                break;
            };
            if gc_pass(&vcb, clock.now_ms()).is_break() {
                break;
            }
        }
        log::trace!("[VCB] garbage collector exiting");
    })
}
