//! File system control codes handled by the driver

pub use crate::fsrtl::oplock::fsctl_oplock::*;

/// CTL_CODE(FILE_DEVICE_FILE_SYSTEM, 6, METHOD_BUFFERED, FILE_ANY_ACCESS)
pub const FSCTL_LOCK_VOLUME: u32 = 0x0009_0018;
/// CTL_CODE(FILE_DEVICE_FILE_SYSTEM, 7, METHOD_BUFFERED, FILE_ANY_ACCESS)
pub const FSCTL_UNLOCK_VOLUME: u32 = 0x0009_001C;
/// CTL_CODE(FILE_DEVICE_FILE_SYSTEM, 10, METHOD_BUFFERED, FILE_ANY_ACCESS)
pub const FSCTL_IS_VOLUME_MOUNTED: u32 = 0x0009_0028;
/// CTL_CODE(FILE_DEVICE_FILE_SYSTEM, 42, METHOD_BUFFERED, FILE_ANY_ACCESS)
pub const FSCTL_GET_REPARSE_POINT: u32 = 0x0009_00A8;

/// Marks the calling handle as the session keepalive
pub const FSCTL_ACTIVATE_KEEPALIVE: u32 = 0x0022_2028;
/// User mode reports a change to a path on the volume
pub const FSCTL_NOTIFY_PATH: u32 = 0x0022_202C;

/// Codes forwarded to the oplock engine
pub const OPLOCK_CODES: [u32; 9] = [
    FSCTL_REQUEST_OPLOCK_LEVEL_1,
    FSCTL_REQUEST_OPLOCK_LEVEL_2,
    FSCTL_REQUEST_BATCH_OPLOCK,
    FSCTL_OPLOCK_BREAK_ACKNOWLEDGE,
    FSCTL_OPBATCH_ACK_CLOSE_PENDING,
    FSCTL_OPLOCK_BREAK_NOTIFY,
    FSCTL_OPLOCK_BREAK_ACK_NO_2,
    FSCTL_REQUEST_FILTER_OPLOCK,
    FSCTL_REQUEST_OPLOCK,
];

#[inline]
pub fn is_oplock_code(code: u32) -> bool {
    OPLOCK_CODES.contains(&code)
}

/// Symbolic name of a control code, for logging
pub fn fsctl_name(code: u32) -> &'static str {
    match code {
        FSCTL_REQUEST_OPLOCK_LEVEL_1 => "FSCTL_REQUEST_OPLOCK_LEVEL_1",
        FSCTL_REQUEST_OPLOCK_LEVEL_2 => "FSCTL_REQUEST_OPLOCK_LEVEL_2",
        FSCTL_REQUEST_BATCH_OPLOCK => "FSCTL_REQUEST_BATCH_OPLOCK",
        FSCTL_OPLOCK_BREAK_ACKNOWLEDGE => "FSCTL_OPLOCK_BREAK_ACKNOWLEDGE",
        FSCTL_OPBATCH_ACK_CLOSE_PENDING => "FSCTL_OPBATCH_ACK_CLOSE_PENDING",
        FSCTL_OPLOCK_BREAK_NOTIFY => "FSCTL_OPLOCK_BREAK_NOTIFY",
        FSCTL_OPLOCK_BREAK_ACK_NO_2 => "FSCTL_OPLOCK_BREAK_ACK_NO_2",
        FSCTL_REQUEST_FILTER_OPLOCK => "FSCTL_REQUEST_FILTER_OPLOCK",
        FSCTL_REQUEST_OPLOCK => "FSCTL_REQUEST_OPLOCK",
        FSCTL_LOCK_VOLUME => "FSCTL_LOCK_VOLUME",
        FSCTL_UNLOCK_VOLUME => "FSCTL_UNLOCK_VOLUME",
        FSCTL_IS_VOLUME_MOUNTED => "FSCTL_IS_VOLUME_MOUNTED",
        FSCTL_GET_REPARSE_POINT => "FSCTL_GET_REPARSE_POINT",
        FSCTL_ACTIVATE_KEEPALIVE => "FSCTL_ACTIVATE_KEEPALIVE",
        FSCTL_NOTIFY_PATH => "FSCTL_NOTIFY_PATH",
        _ => "FSCTL_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oplock_codes() {
        assert!(is_oplock_code(FSCTL_REQUEST_OPLOCK));
        assert!(is_oplock_code(FSCTL_OPLOCK_BREAK_ACK_NO_2));
        assert!(!is_oplock_code(FSCTL_LOCK_VOLUME));
        assert!(!is_oplock_code(FSCTL_NOTIFY_PATH));
        assert_eq!(fsctl_name(FSCTL_REQUEST_FILTER_OPLOCK), "FSCTL_REQUEST_FILTER_OPLOCK");
        assert_eq!(fsctl_name(0x1234), "FSCTL_UNKNOWN");
    }
}
