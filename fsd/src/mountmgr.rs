//! Mount Manager interface
//!
//! Announcing a volume, suspending auto-mount, creating drive-letter mount
//! points, registering the UNC provider and tearing a session down are
//! services of the host's mount manager and MUP. The driver core only
//! sequences them.

use crate::blocks::Dcb;
use crate::status::NtStatus;

/// Prefixes a mount point may carry in the object namespace
const DOS_DEVICE_PREFIXES: [&str; 2] = ["\\DosDevices\\", "\\??\\"];

pub trait MountManager: Send + Sync {
    /// IOCTL_MOUNTMGR_VOLUME_ARRIVAL_NOTIFICATION for a disk device
    fn notify_volume_arrival(&self, disk_device_name: &str) -> NtStatus;

    /// Current auto-mount state (IOCTL_MOUNTMGR_QUERY_AUTO_MOUNT)
    fn query_auto_mount(&self) -> Result<bool, NtStatus>;

    /// IOCTL_MOUNTMGR_SET_AUTO_MOUNT
    fn set_auto_mount(&self, enabled: bool) -> NtStatus;

    /// Create the drive-letter symbolic link of `dcb`
    fn create_mount_point(&self, dcb: &Dcb) -> NtStatus;

    /// Register `dcb`'s UNC name with the multiple UNC provider
    fn register_unc_provider(&self, dcb: &Dcb) -> NtStatus;

    /// Unmount the volume of `dcb` and release the device
    fn unmount(&self, dcb: &Dcb) -> NtStatus;
}

/// Whether `mount_point` names a drive letter (`\DosDevices\M:`) rather
/// than a directory
pub fn is_mount_point_drive_letter(mount_point: &str) -> bool {
    let name = DOS_DEVICE_PREFIXES
        .iter()
        .find_map(|prefix| mount_point.strip_prefix(prefix))
        .unwrap_or(mount_point);

    let bytes = name.as_bytes();
    let is_letter = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    match bytes.len() {
        2 => is_letter,
        3 => is_letter && bytes[2] == b'\\',
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_letter_mount_points() {
        assert!(is_mount_point_drive_letter("\\DosDevices\\M:"));
        assert!(is_mount_point_drive_letter("\\DosDevices\\m:\\"));
        assert!(is_mount_point_drive_letter("\\??\\Z:"));
        assert!(is_mount_point_drive_letter("K:"));

        assert!(!is_mount_point_drive_letter("\\DosDevices\\C:\\mnt\\dokan"));
        assert!(!is_mount_point_drive_letter("\\DosDevices\\1:"));
        assert!(!is_mount_point_drive_letter("\\DosDevices\\"));
        assert!(!is_mount_point_drive_letter(""));
    }
}
