//! Volume mount sequencing (IRP_MN_MOUNT_VOLUME)
//!
//! Brings a volume online on a disk device that user mode has started:
//!
//! 1. Validate: the device extension must be a DCB that is not being removed
//! 2. Create the volume device (secured, and named, for network volumes)
//! 3. Create the VCB and, if configured, start its FCB garbage collector
//! 4. Attach the VPB and mark device and VCB ready
//! 5. Record the volume device in the device's mount entry
//! 6. Arm the liveness deadline and start the check thread
//! 7. Announce the volume to the mount manager
//! 8. Create the drive-letter mount point
//! 9. Register the UNC provider for network volumes
//!
//! A failure in steps 1-2 leaves nothing behind. Once the volume device
//! exists a failure is reported as [`MountFailure::Abandoned`]: the device
//! and everything attached to it stay in place for the unmount path to
//! tear down. Steps 7-9 only log their failures.

use alloc::sync::Arc;

use super::match_dcb_type;
use crate::blocks::vcb::vcb_flags;
use crate::blocks::{BlockRef, ControlBlock, Dcb, Vcb};
use crate::config::{KEEPALIVE_TIMEOUT_DEFAULT_MS, NETWORK_VOLUME_SDDL, VOLUME_LABEL, VOLUME_SERIAL_NUMBER};
use crate::ex::AcquireMode;
use crate::global::DriverGlobal;
use crate::io::device::{device_flags, DeviceObject};
use crate::io::irp::Irp;
use crate::mountmgr::is_mount_point_drive_letter;
use crate::status::NtStatus;
use crate::workers;

/// Mount sequence steps, for failure reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStage {
    Validate,
    CreateDevice,
    InitVcb,
    AttachVpb,
    RegisterEntry,
    StartLiveness,
    AnnounceVolume,
    CreateMountPoint,
    RegisterUnc,
}

/// Why a mount did not complete
#[derive(Debug)]
pub enum MountFailure {
    /// Nothing was committed
    Rejected(NtStatus),
    /// The volume device was created and is left for the unmount path
    Abandoned {
        stage: MountStage,
        status: NtStatus,
        device: Arc<DeviceObject>,
    },
}

impl MountFailure {
    pub fn status(&self) -> NtStatus {
        match self {
            MountFailure::Rejected(status) => *status,
            MountFailure::Abandoned { status, .. } => *status,
        }
    }

    fn abandon(stage: MountStage, status: NtStatus, device: &Arc<DeviceObject>) -> Self {
        log::error!("[MOUNT] {:?} failed: {}", stage, status);
        MountFailure::Abandoned {
            stage,
            status,
            device: Arc::clone(device),
        }
    }
}

/// Mount a volume on the disk device of `irp`
pub fn mount_volume(global: &DriverGlobal, irp: &Irp) -> Result<Arc<Vcb>, MountFailure> {
    log::debug!("[MOUNT] mounting disk device, irp {}", irp.id());

    let params = irp.mount.as_ref().ok_or_else(|| {
        log::debug!("[MOUNT] no mount parameters");
        MountFailure::Rejected(NtStatus::UnrecognizedVolume)
    })?;
    let Some(dcb) = match_dcb_type(params.device.extension().as_ref(), true) else {
        log::debug!("[MOUNT] not a disk device of this driver");
        return Err(MountFailure::Rejected(NtStatus::UnrecognizedVolume));
    };
    if params.device.is_delete_pending() {
        log::error!("[MOUNT] remount attempt of a device being removed");
        return Err(MountFailure::Rejected(NtStatus::DeviceRemoved));
    }

    log::info!(
        "[MOUNT] mounting volume using mount point \"{}\" device \"{}\"",
        dcb.mount_point(),
        dcb.disk_device_name()
    );

    let volume = create_volume_device(global, &dcb).map_err(|status| {
        log::error!("[MOUNT] volume device creation failed: {}", status);
        MountFailure::Rejected(status)
    })?;

    let vcb = Vcb::new(BlockRef::from(&dcb), &volume, dcb.params().fcb_gc_interval_ms);
    volume.set_extension(ControlBlock::Vcb(Arc::clone(&vcb)));
    dcb.set_vcb(Arc::clone(&vcb));
    if vcb.fcb_gc_interval_ms() != 0 {
        workers::start_fcb_garbage_collector(&vcb, &global.collab)
            .map_err(|status| MountFailure::abandon(MountStage::InitVcb, status, &volume))?;
    }

    params.vpb.attach(Arc::clone(&volume), VOLUME_LABEL, VOLUME_SERIAL_NUMBER);
    volume.set_flag(device_flags::DO_DIRECT_IO);
    volume.clear_flag(device_flags::DO_DEVICE_INITIALIZING);
    vcb.set_flag(vcb_flags::VCB_MOUNTED);
    volume.reference();

    register_volume_device(global, &dcb, &volume)
        .map_err(|status| MountFailure::abandon(MountStage::RegisterEntry, status, &volume))?;

    {
        let _dcb_lock = dcb.resource.acquire(AcquireMode::Exclusive);
        dcb.update_timeout(global.collab.clock.now_ms(), KEEPALIVE_TIMEOUT_DEFAULT_MS * 3);
    }
    workers::start_liveness_checker(&dcb, &global.collab)
        .map_err(|status| MountFailure::abandon(MountStage::StartLiveness, status, &volume))?;

    let is_drive_letter = is_mount_point_drive_letter(dcb.mount_point());
    if dcb.params().use_mount_manager {
        announce_volume(global, &dcb, is_drive_letter);
    }

    let mount_manager = &global.collab.mount_manager;
    if is_drive_letter {
        let status = mount_manager.create_mount_point(&dcb);
        if status.is_error() {
            log::error!("[MOUNT] {:?} failed: {}", MountStage::CreateMountPoint, status);
        }
    }

    if dcb.is_network() {
        let mut status = NtStatus::Success;
        global
            .collab
            .threads
            .run_as_system(&mut || status = mount_manager.register_unc_provider(&dcb));
        if status.is_error() {
            log::error!("[MOUNT] {:?} failed: {}", MountStage::RegisterUnc, status);
        }
    }

    log::info!("[MOUNT] mounting successfully done");
    Ok(vcb)
}

fn create_volume_device(global: &DriverGlobal, dcb: &Dcb) -> Result<Arc<DeviceObject>, NtStatus> {
    let params = dcb.params();
    if dcb.is_network() {
        global.collab.io.create_device_secure(
            Some(dcb.disk_device_name()),
            params.device_type,
            params.characteristics,
            NETWORK_VOLUME_SDDL,
        )
    } else {
        global
            .collab
            .io
            .create_device(None, params.device_type, params.characteristics)
    }
}

/// Record the volume device in the device's mount entry
fn register_volume_device(global: &DriverGlobal, dcb: &Dcb, volume: &Arc<DeviceObject>) -> Result<(), NtStatus> {
    let _dcb_lock = dcb.resource.acquire(AcquireMode::Exclusive);
    let Some(entry) = global.mount_table.find_entry(&dcb.mount_key()) else {
        log::error!("[MOUNT] mount entry of {} not found", dcb.disk_device_name());
        return Err(NtStatus::DeviceRemoved);
    };
    let mut entry = entry.lock();
    entry.volume_device = Some(Arc::clone(volume));
    entry.mount_options = dcb.mount_options();
    Ok(())
}

/// Announce the volume to the mount manager.
///
/// A directory mount point must not get a drive letter assigned, so
/// auto-mount is suspended around the announcement.
fn announce_volume(global: &DriverGlobal, dcb: &Dcb, is_drive_letter: bool) {
    let mount_manager = &global.collab.mount_manager;
    let _mount_manager_lock =
        (!is_drive_letter).then(|| global.mount_manager_lock.acquire(AcquireMode::Exclusive));

    let restore_auto_mount = !is_drive_letter && {
        let enabled = mount_manager.query_auto_mount().unwrap_or_else(|status| {
            log::warn!("[MOUNT] auto-mount query failed ({}), assuming enabled", status);
            true
        });
        if enabled {
            mount_manager.set_auto_mount(false);
        }
        enabled
    };

    let status = mount_manager.notify_volume_arrival(dcb.disk_device_name());
    if status.is_error() {
        log::error!("[MOUNT] {:?} failed: {}", MountStage::AnnounceVolume, status);
    }

    if restore_auto_mount {
        mount_manager.set_auto_mount(true);
    }
}
