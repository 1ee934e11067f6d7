//! Driver and device configuration
//!
//! Driver-wide switches live in [`DriverConfig`]; everything a disk device is
//! started with (mount point, options, device class) lives in [`DcbParameters`]
//! and is copied into the device control block when it is registered.

use alloc::string::String;
use bitflags::bitflags;

/// Default keepalive timeout. The liveness deadline set at mount time is
/// three times this value.
pub const KEEPALIVE_TIMEOUT_DEFAULT_MS: u64 = 15_000;

/// How often the liveness checker wakes up
pub const CHECK_INTERVAL_MS: u64 = 1_000;

/// Volume label written into the VPB of every mounted volume
pub const VOLUME_LABEL: &str = "DOKAN";

/// Volume serial number written into the VPB
pub const VOLUME_SERIAL_NUMBER: u32 = 0x1983_1116;

/// Security descriptor applied to network-class volume devices
pub const NETWORK_VOLUME_SDDL: &str = "D:P(A;;GA;;;SY)(A;;GRGWGX;;;BA)(A;;GRGWGX;;;WD)(A;;GRGX;;;RC)";

/// Device types (FILE_DEVICE_*)
pub mod device_type {
    pub const FILE_DEVICE_DISK_FILE_SYSTEM: u32 = 0x0000_0008;
    pub const FILE_DEVICE_FILE_SYSTEM: u32 = 0x0000_0009;
    pub const FILE_DEVICE_NETWORK_FILE_SYSTEM: u32 = 0x0000_0014;
}

bitflags! {
    /// Driver debug switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        /// Default diagnostics
        const DEFAULT = 0x0000_0001;
        /// Log lock acquisition and release
        const LOCK = 0x0000_0100;
        /// Log every oplock request and result
        const OPLOCKS = 0x0000_0200;
    }
}

bitflags! {
    /// Per-device mount options supplied by the user-mode file system
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountOptions: u32 {
        const ALTERNATIVE_STREAM_ON = 0x0000_0001;
        const WRITE_PROTECT = 0x0000_0002;
        const REMOVABLE = 0x0000_0004;
        const MOUNT_MANAGER = 0x0000_0008;
        const CURRENT_SESSION = 0x0000_0010;
        /// Byte-range locks are enforced by user mode, not by the FsRtl lock table
        const FILELOCK_USER_MODE = 0x0000_0020;
        const ENABLE_NETWORK_UNMOUNT = 0x0000_0040;
        const CASE_SENSITIVE = 0x0000_0080;
    }
}

/// Which byte-range lock query the oplock engine may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockQueryMode {
    /// The direct "would this oplock be denied" query is available
    Direct,
    /// Only "are there any current or in-progress locks" is available
    AnyLocksFallback,
}

/// Driver-wide configuration
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub debug: DebugFlags,
    pub lock_query: LockQueryMode,
}

impl DriverConfig {
    pub const fn new() -> Self {
        Self {
            debug: DebugFlags::DEFAULT,
            lock_query: LockQueryMode::Direct,
        }
    }

    /// Whether per-request oplock logging is enabled
    #[inline]
    pub fn oplock_debug_enabled(&self) -> bool {
        self.debug.contains(DebugFlags::OPLOCKS)
    }

    /// Whether lock acquisition and release are logged
    #[inline]
    pub fn lock_debug_enabled(&self) -> bool {
        self.debug.contains(DebugFlags::LOCK)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters a disk device is started with
#[derive(Debug, Clone)]
pub struct DcbParameters {
    /// Mount point, e.g. `\DosDevices\M:` or `\DosDevices\C:\mnt\dokan`
    pub mount_point: String,
    /// Kernel name of the disk device, e.g. `\Device\Volume{guid}`
    pub disk_device_name: String,
    /// UNC name for network volumes, empty otherwise
    pub unc_name: String,
    pub session_id: u32,
    pub mount_options: MountOptions,
    /// Device type of the volume device created at mount time
    pub device_type: u32,
    pub characteristics: u32,
    /// Announce the volume to the mount manager
    pub use_mount_manager: bool,
    /// Delay before a released FCB is freed; zero disables the collector
    pub fcb_gc_interval_ms: u64,
}

impl DcbParameters {
    /// Parameters for a local disk volume with defaults for everything else
    pub fn new(mount_point: &str, disk_device_name: &str) -> Self {
        Self {
            mount_point: String::from(mount_point),
            disk_device_name: String::from(disk_device_name),
            unc_name: String::new(),
            session_id: u32::MAX,
            mount_options: MountOptions::empty(),
            device_type: device_type::FILE_DEVICE_DISK_FILE_SYSTEM,
            characteristics: 0,
            use_mount_manager: false,
            fcb_gc_interval_ms: 0,
        }
    }

    /// Whether the volume is a network-class file system
    #[inline]
    pub fn is_network(&self) -> bool {
        self.device_type == device_type::FILE_DEVICE_NETWORK_FILE_SYSTEM
    }
}
