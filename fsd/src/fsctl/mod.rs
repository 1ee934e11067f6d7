//! File System Control (IRP_MJ_FILE_SYSTEM_CONTROL)
//!
//! Entry point for mount requests and user FSCTLs:
//!
//! - `IRP_MN_MOUNT_VOLUME` goes to the mount sequencer ([`mount`])
//! - `IRP_MN_USER_FS_REQUEST` is routed by control code: oplock codes to
//!   the oplock engine ([`oplock`]), keepalive activation and path
//!   notification to their handlers here, and a few volume codes answered
//!   directly
//!
//! The IRP is completed here with the final status unless the oplock
//! engine took it.

pub mod codes;
pub mod mount;
pub mod oplock;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use codes::*;

use crate::blocks::{resolve_ccb, ControlBlock, Dcb};
use crate::ex::AcquireMode;
use crate::global::DriverGlobal;
use crate::io::irp::{Irp, MinorFunction};
use crate::status::{into_status, NtStatus};

/// Dispatch an IRP_MJ_FILE_SYSTEM_CONTROL request
pub fn dispatch_file_system_control(global: &DriverGlobal, irp: Irp) -> NtStatus {
    let minor = irp.minor_function;
    log::trace!("[FSCTL] begin irp {} {:?}", irp.id(), minor);

    let mut slot = Some(irp);
    let status = match minor {
        MinorFunction::MountVolume => match slot.as_ref().map(|irp| mount::mount_volume(global, irp)) {
            Some(Ok(_)) => NtStatus::Success,
            Some(Err(failure)) => failure.status(),
            None => NtStatus::InvalidParameter,
        },
        MinorFunction::UserFsRequest => user_fs_request(global, &mut slot),
        MinorFunction::Other(minor) => {
            log::debug!("[FSCTL] unsupported minor function 0x{:X}", minor);
            NtStatus::InvalidDeviceRequest
        }
    };

    log::trace!("[FSCTL] end {:?} status {}", minor, status);
    if let Some(irp) = slot.take() {
        irp.complete(status, 0);
    }
    status
}

/// Route an IRP_MN_USER_FS_REQUEST by control code.
///
/// The slot is emptied when the oplock engine takes the IRP.
pub fn user_fs_request(global: &DriverGlobal, slot: &mut Option<Irp>) -> NtStatus {
    let Some(code) = slot.as_ref().map(|irp| irp.fs_control_code) else {
        return NtStatus::InvalidParameter;
    };
    if is_oplock_code(code) {
        return oplock::oplock_request(global, slot);
    }

    let Some(irp) = slot.as_ref() else {
        return NtStatus::InvalidParameter;
    };
    log::trace!("[FSCTL] {} file object {}", fsctl_name(code), irp.file_object_id());

    match code {
        FSCTL_ACTIVATE_KEEPALIVE => into_status(activate_keepalive(irp)),
        FSCTL_NOTIFY_PATH => notify_path(global, irp).unwrap_or_else(|status| status),
        FSCTL_LOCK_VOLUME | FSCTL_UNLOCK_VOLUME | FSCTL_IS_VOLUME_MOUNTED => NtStatus::Success,
        FSCTL_GET_REPARSE_POINT => NtStatus::NotAReparsePoint,
        _ => {
            log::debug!("[FSCTL] unsupported control code 0x{:08X}", code);
            NtStatus::InvalidDeviceRequest
        }
    }
}

/// Make the calling handle the volume's keepalive.
///
/// Only the handle opened on the keepalive file qualifies, and only one
/// handle per volume may ever be active.
fn activate_keepalive(irp: &Irp) -> Result<(), NtStatus> {
    let reject = |what: &str| {
        log::error!("[FSCTL] FSCTL_ACTIVATE_KEEPALIVE rejected: {}", what);
        NtStatus::InvalidParameter
    };

    if irp.file_object.is_none() {
        return Err(reject("no file object"));
    }
    let ccb = resolve_ccb(irp.file_object.as_deref()).map_err(|_| reject("no CCB"))?;
    let fcb = ccb.fcb().map_err(|_| reject("no FCB"))?;
    let vcb = fcb.vcb().map_err(|_| reject("no mounted volume"))?;

    let _fcb_lock = fcb.resource.acquire(AcquireMode::Exclusive);
    if !fcb.is_keepalive() {
        log::error!("[FSCTL] FSCTL_ACTIVATE_KEEPALIVE for wrong file \"{}\"", fcb.file_name());
        return Err(NtStatus::InvalidParameter);
    }
    if vcb.is_keepalive_active() && !ccb.is_keepalive_active() {
        return Err(reject("a different keepalive handle is already active"));
    }

    log::info!(
        "[FSCTL] activating keepalive handle from process {}",
        irp.requestor_process_id
    );
    ccb.set_keepalive_active();
    vcb.set_keepalive_active();
    Ok(())
}

/// Size of the fixed part of a path notification
pub const NOTIFY_PATH_HEADER_SIZE: usize = 10;

/// Decoded FSCTL_NOTIFY_PATH input.
///
/// Wire layout, little endian:
/// ```text
/// u32 completion_filter | u32 action | u16 length | u16 path[length / 2]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPathInput {
    pub completion_filter: u32,
    pub action: u32,
    pub path: String,
}

impl NotifyPathInput {
    pub fn parse(buffer: &[u8]) -> Result<Self, NtStatus> {
        if buffer.len() < NOTIFY_PATH_HEADER_SIZE {
            return Err(NtStatus::BufferTooSmall);
        }
        let completion_filter = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let action = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        let length = usize::from(u16::from_le_bytes([buffer[8], buffer[9]]));

        if length % 2 != 0 {
            return Err(NtStatus::InvalidParameter);
        }
        let name = buffer
            .get(NOTIFY_PATH_HEADER_SIZE..NOTIFY_PATH_HEADER_SIZE + length)
            .ok_or(NtStatus::BufferTooSmall)?;
        let units = name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        let path = char::decode_utf16(units)
            .collect::<Result<String, _>>()
            .map_err(|_| NtStatus::InvalidParameter)?;

        Ok(Self {
            completion_filter,
            action,
            path,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let units: Vec<u16> = self.path.encode_utf16().collect();
        let mut bytes = Vec::with_capacity(NOTIFY_PATH_HEADER_SIZE + units.len() * 2);
        bytes.extend_from_slice(&self.completion_filter.to_le_bytes());
        bytes.extend_from_slice(&self.action.to_le_bytes());
        bytes.extend_from_slice(&((units.len() * 2) as u16).to_le_bytes());
        for unit in units {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes
    }
}

/// Report a change user mode made to a path on the volume
fn notify_path(global: &DriverGlobal, irp: &Irp) -> Result<NtStatus, NtStatus> {
    let input = NotifyPathInput::parse(&irp.input_buffer)?;

    let reject = |what: &str| {
        log::error!("[FSCTL] FSCTL_NOTIFY_PATH rejected: {}", what);
        NtStatus::InvalidParameter
    };
    if irp.file_object.is_none() {
        return Err(reject("no file object"));
    }
    let ccb = resolve_ccb(irp.file_object.as_deref()).map_err(|_| reject("no CCB"))?;
    let fcb = ccb.fcb().map_err(|_| reject("no FCB"))?;

    log::trace!(
        "[FSCTL] notify filter 0x{:X} action {} path \"{}\"",
        input.completion_filter,
        input.action,
        input.path
    );
    let status = {
        let _fcb_lock = fcb.resource.acquire(AcquireMode::Shared);
        global
            .collab
            .notifier
            .report_change(&fcb, &input.path, input.completion_filter, input.action)
    };

    if status == NtStatus::ObjectNameInvalid {
        if let Ok(vcb) = fcb.vcb() {
            global.collab.notifier.cleanup_waiters(&vcb);
        }
    }
    Ok(status)
}

/// The DCB in a device extension, if it is one
pub fn match_dcb_type(block: Option<&ControlBlock>, log_failures: bool) -> Option<Arc<Dcb>> {
    match block {
        None => {
            if log_failures {
                log::debug!("[FSCTL] there is no DCB");
            }
            None
        }
        Some(ControlBlock::Dcb(dcb)) => Some(Arc::clone(dcb)),
        Some(other) => {
            if log_failures {
                log::debug!("[FSCTL] the DCB type is actually {} expected DCB", other.node_type().name());
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::vcb::KEEPALIVE_FILE_NAME;
    use crate::fsrtl::notify::file_action::FILE_ACTION_ADDED;
    use crate::fsrtl::notify::notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME;
    use crate::test_support::{CompletionLog, Fixture};

    fn notify_buffer(path: &str) -> Vec<u8> {
        NotifyPathInput {
            completion_filter: FILE_NOTIFY_CHANGE_FILE_NAME,
            action: FILE_ACTION_ADDED,
            path: String::from(path),
        }
        .to_bytes()
    }

    #[test]
    fn test_fixed_responses_are_completed() {
        let fixture = Fixture::mounted();
        let (file, _) = fixture.open("\\a", false);

        for (code, expected) in [
            (FSCTL_LOCK_VOLUME, NtStatus::Success),
            (FSCTL_UNLOCK_VOLUME, NtStatus::Success),
            (FSCTL_IS_VOLUME_MOUNTED, NtStatus::Success),
            (FSCTL_GET_REPARSE_POINT, NtStatus::NotAReparsePoint),
            (0x0009_00C0, NtStatus::InvalidDeviceRequest),
        ] {
            let log = CompletionLog::new();
            let irp = log.track(fixture.fsctl(code, &file, Vec::new()));
            assert_eq!(dispatch_file_system_control(&fixture.global, irp), expected);
            assert_eq!(log.statuses(), [expected]);
        }
    }

    #[test]
    fn test_unknown_minor_function() {
        let fixture = Fixture::mounted();
        let log = CompletionLog::new();
        let irp = log.track(Irp::with_minor(0x04));
        assert_eq!(dispatch_file_system_control(&fixture.global, irp), NtStatus::InvalidDeviceRequest);
        assert_eq!(log.statuses(), [NtStatus::InvalidDeviceRequest]);
    }

    #[test]
    fn test_delegated_irp_is_not_completed_twice() {
        let fixture = Fixture::mounted();
        let (file, _) = fixture.open("\\a", false);
        fixture.oplocks.respond_with(NtStatus::Pending);

        let log = CompletionLog::new();
        let irp = log.track(fixture.fsctl(FSCTL_REQUEST_OPLOCK_LEVEL_1, &file, Vec::new()));
        assert_eq!(dispatch_file_system_control(&fixture.global, irp), NtStatus::Pending);
        assert!(log.statuses().is_empty());
        assert_eq!(fixture.oplocks.delegations().len(), 1);

        // A failure before delegation leaves completion to the dispatcher
        let irp = log.track(fixture.fsctl(FSCTL_REQUEST_OPLOCK, &file, Vec::new()));
        assert_eq!(dispatch_file_system_control(&fixture.global, irp), NtStatus::BufferTooSmall);
        assert_eq!(log.statuses(), [NtStatus::BufferTooSmall]);
    }

    #[test]
    fn test_keepalive_activation() {
        let fixture = Fixture::mounted();
        let (first, first_ccb) = fixture.open(KEEPALIVE_FILE_NAME, false);
        let (second, second_ccb) = fixture.open(KEEPALIVE_FILE_NAME, false);
        let (other, other_ccb) = fixture.open("\\not_keepalive", false);

        let mut slot = Some(fixture.fsctl(FSCTL_ACTIVATE_KEEPALIVE, &other, Vec::new()));
        assert_eq!(user_fs_request(&fixture.global, &mut slot), NtStatus::InvalidParameter);
        assert!(!other_ccb.is_keepalive_active());
        assert!(!fixture.vcb.is_keepalive_active());

        let mut slot = Some(fixture.fsctl(FSCTL_ACTIVATE_KEEPALIVE, &first, Vec::new()));
        assert_eq!(user_fs_request(&fixture.global, &mut slot), NtStatus::Success);
        assert!(first_ccb.is_keepalive_active());
        assert!(fixture.vcb.is_keepalive_active());

        // Activating the same handle again is allowed
        let mut slot = Some(fixture.fsctl(FSCTL_ACTIVATE_KEEPALIVE, &first, Vec::new()));
        assert_eq!(user_fs_request(&fixture.global, &mut slot), NtStatus::Success);

        // A second handle on the keepalive file is not
        let mut slot = Some(fixture.fsctl(FSCTL_ACTIVATE_KEEPALIVE, &second, Vec::new()));
        assert_eq!(user_fs_request(&fixture.global, &mut slot), NtStatus::InvalidParameter);
        assert!(!second_ccb.is_keepalive_active());

        let mut slot = Some(Irp::user_fs_request(FSCTL_ACTIVATE_KEEPALIVE, None, Vec::new(), 0));
        assert_eq!(user_fs_request(&fixture.global, &mut slot), NtStatus::InvalidParameter);
        assert!(!fixture.vcb.open_fcb(KEEPALIVE_FILE_NAME, false).resource.is_acquired());
    }

    #[test]
    fn test_notify_path_parse() {
        let input = NotifyPathInput::parse(&notify_buffer("\\dir\\ä.txt")).unwrap();
        assert_eq!(input.path, "\\dir\\ä.txt");
        assert_eq!(input.action, FILE_ACTION_ADDED);

        assert_eq!(NotifyPathInput::parse(&[0; 9]), Err(NtStatus::BufferTooSmall));

        let mut truncated = notify_buffer("\\abc");
        truncated.pop();
        assert_eq!(NotifyPathInput::parse(&truncated), Err(NtStatus::BufferTooSmall));

        let mut odd = notify_buffer("\\abc");
        odd[8] = 7;
        assert_eq!(NotifyPathInput::parse(&odd), Err(NtStatus::InvalidParameter));

        // Unpaired high surrogate
        let mut broken = notify_buffer("\\a");
        broken[12..14].copy_from_slice(&0xD800u16.to_le_bytes());
        assert_eq!(NotifyPathInput::parse(&broken), Err(NtStatus::InvalidParameter));
    }

    #[test]
    fn test_notify_path_reports_under_shared_fcb_lock() {
        let fixture = Fixture::mounted();
        let (root, _) = fixture.open("\\", true);

        let mut slot = Some(fixture.fsctl(FSCTL_NOTIFY_PATH, &root, notify_buffer("\\new.txt")));
        assert_eq!(user_fs_request(&fixture.global, &mut slot), NtStatus::Success);

        let reports = fixture.notifier.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].path, "\\new.txt");
        assert_eq!(reports[0].filter, FILE_NOTIFY_CHANGE_FILE_NAME);
        assert_eq!(reports[0].action, FILE_ACTION_ADDED);
        assert!(reports[0].fcb_shared);
        assert_eq!(fixture.notifier.cleanups(), 0);
    }

    #[test]
    fn test_notify_path_invalid_name_cleans_up_waiters() {
        let fixture = Fixture::mounted();
        let (root, _) = fixture.open("\\", true);
        fixture.notifier.respond_with(NtStatus::ObjectNameInvalid);

        let mut slot = Some(fixture.fsctl(FSCTL_NOTIFY_PATH, &root, notify_buffer("bad")));
        assert_eq!(user_fs_request(&fixture.global, &mut slot), NtStatus::ObjectNameInvalid);
        assert_eq!(fixture.notifier.cleanups(), 1);
    }

    #[test]
    fn test_match_dcb_type() {
        let fixture = Fixture::mounted();
        let dcb = ControlBlock::Dcb(Arc::clone(&fixture.dcb));
        let vcb = ControlBlock::Vcb(Arc::clone(&fixture.vcb));

        assert!(match_dcb_type(Some(&dcb), true).is_some());
        assert!(match_dcb_type(fixture.disk.extension().as_ref(), true).is_some());
        assert!(match_dcb_type(Some(&vcb), true).is_none());
        assert!(match_dcb_type(None, false).is_none());
    }
}
