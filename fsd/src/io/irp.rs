//! I/O Request Packet (IRP)
//!
//! Only the file-system-control slice of an IRP is modelled: the minor
//! function, the FSCTL code with its buffers, the target file object and,
//! for mount requests, the device and VPB being mounted.
//!
//! An `Irp` is a move-only value. Whoever holds it must eventually call
//! [`Irp::complete`], which consumes it; handing it to another component
//! transfers that obligation.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use super::device::{DeviceObject, Vpb};
use super::file::FileObject;
use crate::status::NtStatus;

/// Major function code of every request this crate dispatches
pub const IRP_MJ_FILE_SYSTEM_CONTROL: u8 = 0x0D;

/// Minor functions of IRP_MJ_FILE_SYSTEM_CONTROL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinorFunction {
    /// IRP_MN_USER_FS_REQUEST
    UserFsRequest,
    /// IRP_MN_MOUNT_VOLUME
    MountVolume,
    /// Any other minor code
    Other(u8),
}

impl MinorFunction {
    pub const IRP_MN_USER_FS_REQUEST: u8 = 0x00;
    pub const IRP_MN_MOUNT_VOLUME: u8 = 0x01;

    pub fn from_raw(minor: u8) -> Self {
        match minor {
            Self::IRP_MN_USER_FS_REQUEST => MinorFunction::UserFsRequest,
            Self::IRP_MN_MOUNT_VOLUME => MinorFunction::MountVolume,
            other => MinorFunction::Other(other),
        }
    }
}

/// I/O status block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatusBlock {
    pub status: NtStatus,
    pub information: usize,
}

/// Parameters of IRP_MN_MOUNT_VOLUME
#[derive(Clone)]
pub struct MountParameters {
    /// Disk device whose extension carries the DCB
    pub device: Arc<DeviceObject>,
    /// VPB the new volume device is attached to
    pub vpb: Arc<Vpb>,
}

type CompletionRoutine = Box<dyn FnOnce(IoStatusBlock) + Send>;

static NEXT_IRP_ID: AtomicU64 = AtomicU64::new(1);

/// I/O Request Packet
pub struct Irp {
    id: u64,
    pub minor_function: MinorFunction,
    pub fs_control_code: u32,
    pub input_buffer: Vec<u8>,
    pub output_buffer_length: u32,
    pub file_object: Option<Arc<FileObject>>,
    pub requestor_process_id: u32,
    pub mount: Option<MountParameters>,
    completion: Option<CompletionRoutine>,
}

impl Irp {
    fn new(minor_function: MinorFunction) -> Self {
        Self {
            id: NEXT_IRP_ID.fetch_add(1, Ordering::Relaxed),
            minor_function,
            fs_control_code: 0,
            input_buffer: Vec::new(),
            output_buffer_length: 0,
            file_object: None,
            requestor_process_id: 0,
            mount: None,
            completion: None,
        }
    }

    /// IRP_MN_USER_FS_REQUEST carrying `code`
    pub fn user_fs_request(
        code: u32,
        file_object: Option<Arc<FileObject>>,
        input_buffer: Vec<u8>,
        output_buffer_length: u32,
    ) -> Self {
        let mut irp = Self::new(MinorFunction::UserFsRequest);
        irp.fs_control_code = code;
        irp.file_object = file_object;
        irp.input_buffer = input_buffer;
        irp.output_buffer_length = output_buffer_length;
        irp
    }

    /// IRP_MN_MOUNT_VOLUME for `device`
    pub fn mount_volume(device: Arc<DeviceObject>, vpb: Arc<Vpb>) -> Self {
        let mut irp = Self::new(MinorFunction::MountVolume);
        irp.mount = Some(MountParameters { device, vpb });
        irp
    }

    /// IRP with an arbitrary minor function and no parameters
    pub fn with_minor(minor: u8) -> Self {
        Self::new(MinorFunction::from_raw(minor))
    }

    pub fn with_requestor(mut self, process_id: u32) -> Self {
        self.requestor_process_id = process_id;
        self
    }

    /// Install the routine run when the IRP is completed
    pub fn on_complete<F>(mut self, routine: F) -> Self
    where
        F: FnOnce(IoStatusBlock) + Send + 'static,
    {
        self.completion = Some(Box::new(routine));
        self
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identifier of the target file object, zero when there is none
    pub fn file_object_id(&self) -> u64 {
        self.file_object.as_ref().map_or(0, |file_object| file_object.id())
    }

    /// Complete the request. Consumes the IRP.
    pub fn complete(mut self, status: NtStatus, information: usize) {
        log::trace!("[IRP] complete irp {} status {}", self.id, status);
        if let Some(routine) = self.completion.take() {
            routine(IoStatusBlock { status, information });
        }
    }
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irp")
            .field("id", &self.id)
            .field("minor_function", &self.minor_function)
            .field("fs_control_code", &format_args!("0x{:08X}", self.fs_control_code))
            .field("input_length", &self.input_buffer.len())
            .field("output_buffer_length", &self.output_buffer_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_complete_runs_routine_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let irp = Irp::user_fs_request(0x0009_0028, None, Vec::new(), 0)
            .on_complete(move |iosb| sink.lock().unwrap().push(iosb));

        assert_eq!(irp.file_object_id(), 0);
        irp.complete(NtStatus::Success, 3);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], IoStatusBlock { status: NtStatus::Success, information: 3 });
    }

    #[test]
    fn test_minor_from_raw() {
        assert_eq!(MinorFunction::from_raw(0), MinorFunction::UserFsRequest);
        assert_eq!(MinorFunction::from_raw(1), MinorFunction::MountVolume);
        assert_eq!(MinorFunction::from_raw(4), MinorFunction::Other(4));
        assert_ne!(Irp::with_minor(0).id(), Irp::with_minor(0).id());
    }
}
