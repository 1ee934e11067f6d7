//! NTSTATUS Result Codes
//!
//! Every handler in the driver reports its outcome as one of a small, closed
//! set of NT status values. Internal helpers return `Result<T, NtStatus>` so
//! failures propagate with `?`; dispatch boundaries flatten the result back
//! into a bare status with [`into_status`].

use core::fmt;

/// NT status codes used by the driver
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NtStatus {
    /// STATUS_SUCCESS
    Success = 0x0000_0000,
    /// STATUS_PENDING - the request was queued and will complete later
    Pending = 0x0000_0103,
    /// STATUS_OPLOCK_BREAK_IN_PROGRESS
    OplockBreakInProgress = 0x0000_0108,
    /// STATUS_UNSUCCESSFUL
    Unsuccessful = 0xC000_0001u32 as i32,
    /// STATUS_INVALID_PARAMETER
    InvalidParameter = 0xC000_000Du32 as i32,
    /// STATUS_NO_SUCH_DEVICE
    NoSuchDevice = 0xC000_000Eu32 as i32,
    /// STATUS_INVALID_DEVICE_REQUEST - the request is not supported
    InvalidDeviceRequest = 0xC000_0010u32 as i32,
    /// STATUS_BUFFER_TOO_SMALL
    BufferTooSmall = 0xC000_0023u32 as i32,
    /// STATUS_OBJECT_NAME_INVALID
    ObjectNameInvalid = 0xC000_0033u32 as i32,
    /// STATUS_OBJECT_NAME_COLLISION
    ObjectNameCollision = 0xC000_0035u32 as i32,
    /// STATUS_DELETE_PENDING
    DeletePending = 0xC000_0056u32 as i32,
    /// STATUS_INSUFFICIENT_RESOURCES
    InsufficientResources = 0xC000_009Au32 as i32,
    /// STATUS_OPLOCK_NOT_GRANTED
    OplockNotGranted = 0xC000_00E2u32 as i32,
    /// STATUS_INVALID_OPLOCK_PROTOCOL
    InvalidOplockProtocol = 0xC000_00E3u32 as i32,
    /// STATUS_CANCELLED
    Cancelled = 0xC000_0120u32 as i32,
    /// STATUS_UNRECOGNIZED_VOLUME
    UnrecognizedVolume = 0xC000_014Fu32 as i32,
    /// STATUS_NOT_A_REPARSE_POINT
    NotAReparsePoint = 0xC000_0275u32 as i32,
    /// STATUS_DEVICE_REMOVED
    DeviceRemoved = 0xC000_02B6u32 as i32,
}

impl NtStatus {
    /// Raw NTSTATUS value
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// NT_SUCCESS(): success and informational codes
    #[inline]
    pub const fn is_success(self) -> bool {
        self.code() >= 0
    }

    /// NT_ERROR(): severity bits are 0b11
    #[inline]
    pub const fn is_error(self) -> bool {
        (self.code() as u32) >> 30 == 3
    }

    /// Convert a status into a `Result`, treating every NT_SUCCESS code as Ok
    #[inline]
    pub fn ok(self) -> Result<(), NtStatus> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Symbolic name, as used in the log
    pub const fn name(self) -> &'static str {
        match self {
            NtStatus::Success => "STATUS_SUCCESS",
            NtStatus::Pending => "STATUS_PENDING",
            NtStatus::OplockBreakInProgress => "STATUS_OPLOCK_BREAK_IN_PROGRESS",
            NtStatus::Unsuccessful => "STATUS_UNSUCCESSFUL",
            NtStatus::InvalidParameter => "STATUS_INVALID_PARAMETER",
            NtStatus::NoSuchDevice => "STATUS_NO_SUCH_DEVICE",
            NtStatus::InvalidDeviceRequest => "STATUS_INVALID_DEVICE_REQUEST",
            NtStatus::BufferTooSmall => "STATUS_BUFFER_TOO_SMALL",
            NtStatus::ObjectNameInvalid => "STATUS_OBJECT_NAME_INVALID",
            NtStatus::ObjectNameCollision => "STATUS_OBJECT_NAME_COLLISION",
            NtStatus::DeletePending => "STATUS_DELETE_PENDING",
            NtStatus::InsufficientResources => "STATUS_INSUFFICIENT_RESOURCES",
            NtStatus::OplockNotGranted => "STATUS_OPLOCK_NOT_GRANTED",
            NtStatus::InvalidOplockProtocol => "STATUS_INVALID_OPLOCK_PROTOCOL",
            NtStatus::Cancelled => "STATUS_CANCELLED",
            NtStatus::UnrecognizedVolume => "STATUS_UNRECOGNIZED_VOLUME",
            NtStatus::NotAReparsePoint => "STATUS_NOT_A_REPARSE_POINT",
            NtStatus::DeviceRemoved => "STATUS_DEVICE_REMOVED",
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.code() as u32)
    }
}

/// Flatten a unit result into the status reported to the I/O manager
#[inline]
pub fn into_status(result: Result<(), NtStatus>) -> NtStatus {
    match result {
        Ok(()) => NtStatus::Success,
        Err(status) => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(NtStatus::Success.is_success());
        assert!(NtStatus::Pending.is_success());
        assert!(!NtStatus::Pending.is_error());
        assert!(NtStatus::InvalidParameter.is_error());
        assert!(!NtStatus::DeviceRemoved.is_success());
    }

    #[test]
    fn test_codes_match_nt() {
        assert_eq!(NtStatus::InvalidParameter.code() as u32, 0xC000_000D);
        assert_eq!(NtStatus::DeletePending.code() as u32, 0xC000_0056);
        assert_eq!(NtStatus::DeviceRemoved.code() as u32, 0xC000_02B6);
    }

    #[test]
    fn test_ok_and_flatten() {
        assert_eq!(NtStatus::Pending.ok(), Ok(()));
        assert_eq!(NtStatus::BufferTooSmall.ok(), Err(NtStatus::BufferTooSmall));
        assert_eq!(into_status(Err(NtStatus::DeletePending)), NtStatus::DeletePending);
        assert_eq!(into_status(Ok(())), NtStatus::Success);
    }
}
