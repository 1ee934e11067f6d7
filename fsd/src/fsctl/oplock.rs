//! Oplock request handling
//!
//! Validates an oplock FSCTL against the file it targets, takes the locks
//! the request class needs, computes the open count the oplock package
//! arbitrates with, and hands the IRP over to [`OplockFacility`].
//!
//! # Lock classes
//!
//! | Request                                            | VCB | FCB |
//! |----------------------------------------------------|-----|-----|
//! | level 1, level 2, batch, filter, generic + REQUEST | RO  | RW  |
//! | break ack, close pending, break notify, ack no 2,  |     |     |
//! | generic + ACK                                      |  -  | RO  |
//!
//! Once the IRP has been handed to the facility the request slot is empty
//! and the caller must not complete it.

use super::codes::*;
use crate::blocks::oplock_debug::oplock_debug_flags;
use crate::blocks::{resolve, Fcb, Resolved, Vcb};
use crate::config::{LockQueryMode, MountOptions};
use crate::ex::{AcquireMode, ResourceGuard};
use crate::fsrtl::oplock::{is_shared_request, RequestOplockInput, REQUEST_OPLOCK_OUTPUT_BUFFER_SIZE};
use crate::global::DriverGlobal;
use crate::io::irp::{Irp, IRP_MJ_FILE_SYSTEM_CONTROL};
use crate::status::NtStatus;

/// How an oplock FSCTL is synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OplockRequestClass {
    /// Asks for a new oplock
    Request,
    /// Acknowledges or waits on a break
    Acknowledge,
}

fn classify(code: u32, input: Option<&RequestOplockInput>) -> Result<OplockRequestClass, NtStatus> {
    match code {
        FSCTL_REQUEST_OPLOCK_LEVEL_1
        | FSCTL_REQUEST_BATCH_OPLOCK
        | FSCTL_REQUEST_FILTER_OPLOCK
        | FSCTL_REQUEST_OPLOCK_LEVEL_2 => Ok(OplockRequestClass::Request),
        FSCTL_OPLOCK_BREAK_ACKNOWLEDGE
        | FSCTL_OPBATCH_ACK_CLOSE_PENDING
        | FSCTL_OPLOCK_BREAK_NOTIFY
        | FSCTL_OPLOCK_BREAK_ACK_NO_2 => Ok(OplockRequestClass::Acknowledge),
        FSCTL_REQUEST_OPLOCK => match input {
            Some(input) if input.is_request() => Ok(OplockRequestClass::Request),
            Some(input) if input.is_ack() => Ok(OplockRequestClass::Acknowledge),
            _ => {
                log::debug!("[OPLOCK] generic request without REQUEST or ACK flag");
                Err(NtStatus::InvalidParameter)
            }
        },
        _ => Err(NtStatus::InvalidParameter),
    }
}

/// Locks held across delegation.
///
/// Fields drop in declaration order, so the FCB lock is always released
/// before the VCB lock. The VCB lock can only be taken by the constructor
/// that also takes the FCB lock after it.
struct HeldLocks<'a> {
    fcb: ResourceGuard<'a>,
    vcb: Option<ResourceGuard<'a>>,
    /// File name to log acquisition and release under, if lock logging is on
    traced: Option<&'a str>,
}

impl<'a> HeldLocks<'a> {
    /// VCB shared, then FCB exclusive
    fn volume_then_file(vcb: &'a Vcb, fcb: &'a Fcb, trace: bool) -> Self {
        let vcb = vcb.resource.acquire(AcquireMode::Shared);
        let fcb_guard = fcb.resource.acquire(AcquireMode::Exclusive);
        Self::traced(fcb_guard, Some(vcb), fcb, trace)
    }

    /// FCB shared only
    fn file_only(fcb: &'a Fcb, trace: bool) -> Self {
        let fcb_guard = fcb.resource.acquire(AcquireMode::Shared);
        Self::traced(fcb_guard, None, fcb, trace)
    }

    fn traced(fcb_guard: ResourceGuard<'a>, vcb: Option<ResourceGuard<'a>>, fcb: &'a Fcb, trace: bool) -> Self {
        let locks = Self {
            fcb: fcb_guard,
            vcb,
            traced: trace.then(|| fcb.file_name()),
        };
        if let Some(name) = locks.traced {
            log::info!("[OPLOCK] {}: acquired {}", name, locks.describe());
        }
        locks
    }

    fn acquired_vcb(&self) -> bool {
        self.vcb.is_some()
    }

    fn fcb_mode(&self) -> AcquireMode {
        self.fcb.mode()
    }

    fn describe(&self) -> alloc::string::String {
        if self.acquired_vcb() {
            alloc::format!("VCB RO, FCB {}", self.fcb_mode())
        } else {
            alloc::format!("FCB {}", self.fcb_mode())
        }
    }
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        if let Some(name) = self.traced {
            log::info!("[OPLOCK] {}: releasing {}", name, self.describe());
        }
    }
}

/// Whether the request must fail on a file that is being deleted
fn blocked_by_delete_pending(code: u32, input: Option<&RequestOplockInput>) -> bool {
    match code {
        FSCTL_REQUEST_FILTER_OPLOCK | FSCTL_REQUEST_BATCH_OPLOCK => true,
        FSCTL_REQUEST_OPLOCK => input.is_some_and(RequestOplockInput::wants_handle_caching),
        _ => false,
    }
}

/// Open count the oplock package arbitrates a grant with
fn oplock_count(
    global: &DriverGlobal,
    fcb: &Fcb,
    mount_options: MountOptions,
    shared: bool,
) -> u32 {
    if mount_options.contains(MountOptions::FILELOCK_USER_MODE) {
        // Byte-range locks live in user mode; nothing to consult here
        return 0;
    }
    if !shared {
        return fcb.file_count();
    }
    if fcb.is_directory() {
        return 0;
    }
    let denied = match global.config.lock_query {
        LockQueryMode::Direct => !fcb
            .file_lock()
            .check_lock_for_oplock_request(fcb.allocation_size()),
        LockQueryMode::AnyLocksFallback => fcb.file_lock().are_there_current_or_in_progress_locks(),
    };
    u32::from(denied)
}

/// Handle an oplock FSCTL.
///
/// On delegation the IRP is taken out of `slot`; on every other path it is
/// left there for the caller to complete.
pub fn oplock_request(global: &DriverGlobal, slot: &mut Option<Irp>) -> NtStatus {
    match try_oplock_request(global, slot) {
        Ok(status) | Err(status) => status,
    }
}

fn try_oplock_request(global: &DriverGlobal, slot: &mut Option<Irp>) -> Result<NtStatus, NtStatus> {
    let irp = slot.as_ref().ok_or(NtStatus::InvalidParameter)?;
    let code = irp.fs_control_code;
    log::trace!("[OPLOCK] {} on file object {}", fsctl_name(code), irp.file_object_id());

    let Resolved { fcb, vcb, dcb, .. } = resolve(irp.file_object.as_deref())?;
    fcb.oplock_debug().record_major_function(IRP_MJ_FILE_SYSTEM_CONTROL);

    let input = if code == FSCTL_REQUEST_OPLOCK {
        let input = RequestOplockInput::parse(&irp.input_buffer)?;
        if irp.output_buffer_length < REQUEST_OPLOCK_OUTPUT_BUFFER_SIZE {
            log::debug!(
                "[OPLOCK] output buffer {} bytes, need {}",
                irp.output_buffer_length,
                REQUEST_OPLOCK_OUTPUT_BUFFER_SIZE
            );
            return Err(NtStatus::BufferTooSmall);
        }
        Some(input)
    } else {
        None
    };

    let shared = is_shared_request(code, input.as_ref());
    if fcb.is_directory() && !(code == FSCTL_REQUEST_OPLOCK && shared) {
        log::debug!("[OPLOCK] only read oplocks are allowed on directory {}", fcb.file_name());
        return Err(NtStatus::InvalidParameter);
    }

    let trace_locks = global.config.lock_debug_enabled();
    let (locks, count) = match classify(code, input.as_ref())? {
        OplockRequestClass::Request => {
            let locks = HeldLocks::volume_then_file(&vcb, &fcb, trace_locks);
            let count = oplock_count(global, &fcb, dcb.mount_options(), shared);
            (locks, count)
        }
        OplockRequestClass::Acknowledge => (HeldLocks::file_only(&fcb, trace_locks), 0),
    };

    if blocked_by_delete_pending(code, input.as_ref()) && fcb.is_delete_on_close() {
        log::debug!("[OPLOCK] {} is delete pending", fcb.file_name());
        return Err(NtStatus::DeletePending);
    }

    let (level, flags) = input.map_or((0, 0), |input| (input.requested_level, input.flags));
    let debug = fcb.oplock_debug();
    debug.record_request(code, level);
    if input.is_some_and(|input| input.is_ack()) {
        debug.record_flag(oplock_debug_flags::DOKAN_OPLOCK_DEBUG_GENERIC_ACKNOWLEDGEMENT);
    }

    let verbose = global.config.oplock_debug_enabled();
    if verbose {
        log::info!(
            "[OPLOCK] {}: {} level 0x{:X} flags 0x{:X} count {} ({})",
            fcb.file_name(),
            fsctl_name(code),
            level,
            flags,
            count,
            locks.describe(),
        );
    }

    let irp = slot.take().ok_or(NtStatus::InvalidParameter)?;
    let status = global.collab.oplocks.oplock_fsctrl(fcb.oplock(), irp, count);

    if verbose {
        log::info!("[OPLOCK] {}: {} returned {}", fcb.file_name(), fsctl_name(code), status);
    }

    drop(locks);
    Ok(status)
}
