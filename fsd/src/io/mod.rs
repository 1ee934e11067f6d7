//! I/O manager surface used by the file system
//!
//! - `irp`: request packets and their completion
//! - `device`: device objects, VPBs and device creation
//! - `file`: file objects carrying per-handle context

pub mod device;
pub mod file;
pub mod irp;

pub use device::{device_flags, DeviceNamespace, DeviceObject, IoManager, Vpb};
pub use file::FileObject;
pub use irp::{IoStatusBlock, Irp, MinorFunction, MountParameters, IRP_MJ_FILE_SYSTEM_CONTROL};
