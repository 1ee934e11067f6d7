//! Device objects and volume parameter blocks
//!
//! Every device the driver owns carries one control block as its
//! extension: disk devices carry a DCB, volume devices a VCB. Device
//! creation goes through [`IoManager`] so the mount path can be driven
//! against the real object namespace or a test double.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::{Mutex, RwLock};

use crate::blocks::ControlBlock;
use crate::status::NtStatus;

/// Device object flags (DO_*)
pub mod device_flags {
    pub const DO_VERIFY_VOLUME: u32 = 0x0000_0002;
    pub const DO_BUFFERED_IO: u32 = 0x0000_0004;
    pub const DO_DIRECT_IO: u32 = 0x0000_0010;
    pub const DO_DEVICE_INITIALIZING: u32 = 0x0000_0080;
}

/// Device object
pub struct DeviceObject {
    name: Option<String>,
    device_type: u32,
    characteristics: u32,
    flags: AtomicU32,
    /// Security descriptor applied at creation, if any
    sddl: Option<String>,
    delete_pending: AtomicBool,
    /// Outstanding references beyond the creator's
    reference_count: AtomicU32,
    /// Device extension
    extension: RwLock<Option<ControlBlock>>,
}

impl DeviceObject {
    /// New device, still flagged DO_DEVICE_INITIALIZING
    pub fn new(name: Option<&str>, device_type: u32, characteristics: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.map(String::from),
            device_type,
            characteristics,
            flags: AtomicU32::new(device_flags::DO_DEVICE_INITIALIZING),
            sddl: None,
            delete_pending: AtomicBool::new(false),
            reference_count: AtomicU32::new(0),
            extension: RwLock::new(None),
        })
    }

    /// New device protected by a security descriptor
    pub fn new_secure(name: Option<&str>, device_type: u32, characteristics: u32, sddl: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.map(String::from),
            device_type,
            characteristics,
            flags: AtomicU32::new(device_flags::DO_DEVICE_INITIALIZING),
            sddl: Some(String::from(sddl)),
            delete_pending: AtomicBool::new(false),
            reference_count: AtomicU32::new(0),
            extension: RwLock::new(None),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    pub fn characteristics(&self) -> u32 {
        self.characteristics
    }

    pub fn sddl(&self) -> Option<&str> {
        self.sddl.as_deref()
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    /// Whether the device is being torn down
    pub fn is_delete_pending(&self) -> bool {
        self.delete_pending.load(Ordering::Acquire)
    }

    pub fn mark_delete_pending(&self) {
        self.delete_pending.store(true, Ordering::Release);
    }

    /// ObReferenceObject
    pub fn reference(&self) {
        self.reference_count.fetch_add(1, Ordering::AcqRel);
    }

    /// ObDereferenceObject
    pub fn dereference(&self) {
        let _ = self
            .reference_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    /// The control block stored in the device extension
    pub fn extension(&self) -> Option<ControlBlock> {
        self.extension.read().clone()
    }

    pub fn set_extension(&self, block: ControlBlock) {
        *self.extension.write() = Some(block);
    }
}

impl core::fmt::Debug for DeviceObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceObject")
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("flags", &format_args!("0x{:08X}", self.flags()))
            .finish()
    }
}

/// Maximum label length in a VPB, in characters
pub const MAXIMUM_VOLUME_LABEL_LENGTH: usize = 32;

#[derive(Default)]
struct VpbState {
    device: Option<Arc<DeviceObject>>,
    label: String,
    serial_number: u32,
}

/// Volume parameter block, linking a disk device to its mounted volume
#[derive(Default)]
pub struct Vpb {
    state: Mutex<VpbState>,
}

impl Vpb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach the volume device and stamp label and serial number
    pub fn attach(&self, device: Arc<DeviceObject>, label: &str, serial_number: u32) {
        let mut state = self.state.lock();
        state.device = Some(device);
        state.label = label.chars().take(MAXIMUM_VOLUME_LABEL_LENGTH).collect();
        state.serial_number = serial_number;
    }

    pub fn device(&self) -> Option<Arc<DeviceObject>> {
        self.state.lock().device.clone()
    }

    pub fn label(&self) -> String {
        self.state.lock().label.clone()
    }

    /// Label length in bytes, as UTF-16
    pub fn label_length(&self) -> u16 {
        (self.state.lock().label.encode_utf16().count() * 2) as u16
    }

    pub fn serial_number(&self) -> u32 {
        self.state.lock().serial_number
    }
}

/// Device creation (IoCreateDevice / IoCreateDeviceSecure)
pub trait IoManager: Send + Sync {
    fn create_device(
        &self,
        name: Option<&str>,
        device_type: u32,
        characteristics: u32,
    ) -> Result<Arc<DeviceObject>, NtStatus>;

    fn create_device_secure(
        &self,
        name: Option<&str>,
        device_type: u32,
        characteristics: u32,
        sddl: &str,
    ) -> Result<Arc<DeviceObject>, NtStatus>;
}

/// Object-namespace backed device creation; named devices must be unique
#[derive(Default)]
pub struct DeviceNamespace {
    names: Mutex<BTreeSet<String>>,
}

impl DeviceNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, name: Option<&str>) -> Result<(), NtStatus> {
        if let Some(name) = name {
            if !self.names.lock().insert(String::from(name)) {
                log::warn!("[IO] device name {} already exists", name);
                return Err(NtStatus::ObjectNameCollision);
            }
        }
        Ok(())
    }

    /// Forget a device name so it can be created again
    pub fn release(&self, name: &str) -> bool {
        self.names.lock().remove(name)
    }
}

impl IoManager for DeviceNamespace {
    fn create_device(
        &self,
        name: Option<&str>,
        device_type: u32,
        characteristics: u32,
    ) -> Result<Arc<DeviceObject>, NtStatus> {
        self.claim(name)?;
        Ok(DeviceObject::new(name, device_type, characteristics))
    }

    fn create_device_secure(
        &self,
        name: Option<&str>,
        device_type: u32,
        characteristics: u32,
        sddl: &str,
    ) -> Result<Arc<DeviceObject>, NtStatus> {
        self.claim(name)?;
        Ok(DeviceObject::new_secure(name, device_type, characteristics, sddl))
    }
}
