//! Mock host services and mounted-volume fixtures for unit tests

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::blocks::vcb::vcb_flags;
use crate::blocks::{resolve, BlockRef, Ccb, ControlBlock, Dcb, Fcb, Vcb};
use crate::config::{device_type, DcbParameters, DriverConfig, MountOptions};
use crate::ex::{Clock, SystemThreads, ThreadBody};
use crate::fsrtl::notify::ChangeNotifier;
use crate::fsrtl::oplock::{Oplock, OplockFacility, REQUEST_OPLOCK_OUTPUT_BUFFER_SIZE};
use crate::global::{Collaborators, DriverGlobal};
use crate::io::device::{DeviceNamespace, DeviceObject, IoManager, Vpb};
use crate::io::file::FileObject;
use crate::io::irp::Irp;
use crate::mountmgr::MountManager;
use crate::status::NtStatus;

/// Device creation through a real namespace, with injectable failure
#[derive(Default)]
pub struct MockIo {
    namespace: DeviceNamespace,
    fail: Mutex<Option<NtStatus>>,
}

impl MockIo {
    pub fn fail_with(&self, status: NtStatus) {
        *self.fail.lock() = Some(status);
    }
}

impl IoManager for MockIo {
    fn create_device(
        &self,
        name: Option<&str>,
        device_type: u32,
        characteristics: u32,
    ) -> Result<Arc<DeviceObject>, NtStatus> {
        if let Some(status) = *self.fail.lock() {
            return Err(status);
        }
        self.namespace.create_device(name, device_type, characteristics)
    }

    fn create_device_secure(
        &self,
        name: Option<&str>,
        device_type: u32,
        characteristics: u32,
        sddl: &str,
    ) -> Result<Arc<DeviceObject>, NtStatus> {
        if let Some(status) = *self.fail.lock() {
            return Err(status);
        }
        self.namespace.create_device_secure(name, device_type, characteristics, sddl)
    }
}

/// Queues thread bodies until the test runs them
#[derive(Default)]
pub struct MockThreads {
    pending: Mutex<Vec<(&'static str, ThreadBody)>>,
    started: Mutex<Vec<&'static str>>,
    fail_all: Option<NtStatus>,
    fail_named: Mutex<Vec<(&'static str, NtStatus)>>,
    system_runs: AtomicUsize,
}

impl MockThreads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every thread creation fails with `status`
    pub fn failing(status: NtStatus) -> Self {
        Self {
            fail_all: Some(status),
            ..Self::default()
        }
    }

    /// Creation of the thread called `name` fails with `status`
    pub fn fail_on(&self, name: &'static str, status: NtStatus) {
        self.fail_named.lock().push((name, status));
    }

    pub fn started(&self) -> Vec<&'static str> {
        self.started.lock().clone()
    }

    pub fn system_runs(&self) -> usize {
        self.system_runs.load(Ordering::SeqCst)
    }

    /// Run queued bodies in start order, including any they start
    pub fn run_pending(&self) {
        loop {
            let next = {
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    break;
                }
                pending.remove(0)
            };
            (next.1)();
        }
    }
}

impl SystemThreads for MockThreads {
    fn create_system_thread(&self, name: &'static str, body: ThreadBody) -> Result<(), NtStatus> {
        if let Some(status) = self.fail_all {
            return Err(status);
        }
        if let Some(&(_, status)) = self.fail_named.lock().iter().find(|(failing, _)| *failing == name) {
            return Err(status);
        }
        self.started.lock().push(name);
        self.pending.lock().push((name, body));
        Ok(())
    }

    fn run_as_system(&self, work: &mut dyn FnMut()) {
        self.system_runs.fetch_add(1, Ordering::SeqCst);
        work();
    }
}

type SleepHook = Box<dyn FnMut(u64) + Send>;

/// Manual clock; sleeping advances it
#[derive(Default)]
pub struct MockClock {
    now: AtomicU64,
    on_sleep: Mutex<Option<SleepHook>>,
}

impl MockClock {
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Run `hook` with the new time after every sleep
    pub fn on_sleep<F>(&self, hook: F)
    where
        F: FnMut(u64) + Send + 'static,
    {
        *self.on_sleep.lock() = Some(Box::new(hook));
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        let now = self.now.fetch_add(ms, Ordering::SeqCst) + ms;
        if let Some(hook) = self.on_sleep.lock().as_mut() {
            hook(now);
        }
    }
}

/// A call made to the mount manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    NotifyArrival(String),
    QueryAutoMount,
    SetAutoMount(bool),
    /// Carries the mount point
    CreateMountPoint(String),
    /// Carries the disk device name
    RegisterUnc(String),
    /// Carries the disk device name
    Unmount(String),
}

type ArrivalProbe = Box<dyn Fn() -> bool + Send + Sync>;

/// Records mount manager calls
pub struct MockMountManager {
    calls: Mutex<Vec<MountCall>>,
    auto_mount: Mutex<Result<bool, NtStatus>>,
    arrival_status: Mutex<NtStatus>,
    arrival_probe: Mutex<Option<ArrivalProbe>>,
    lock_held_during_arrival: AtomicBool,
}

impl Default for MockMountManager {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            auto_mount: Mutex::new(Ok(true)),
            arrival_status: Mutex::new(NtStatus::Success),
            arrival_probe: Mutex::new(None),
            lock_held_during_arrival: AtomicBool::new(false),
        }
    }
}

impl MockMountManager {
    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().clone()
    }

    pub fn fail_auto_mount_query(&self, status: NtStatus) {
        *self.auto_mount.lock() = Err(status);
    }

    pub fn fail_arrival(&self, status: NtStatus) {
        *self.arrival_status.lock() = status;
    }

    /// Whether the probe saw the mount manager lock held at arrival time
    pub fn lock_held_during_arrival(&self) -> bool {
        self.lock_held_during_arrival.load(Ordering::SeqCst)
    }

    fn probe_arrival<F>(&self, probe: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        *self.arrival_probe.lock() = Some(Box::new(probe));
    }

    fn record(&self, call: MountCall) {
        self.calls.lock().push(call);
    }
}

impl MountManager for MockMountManager {
    fn notify_volume_arrival(&self, disk_device_name: &str) -> NtStatus {
        self.record(MountCall::NotifyArrival(String::from(disk_device_name)));
        if let Some(probe) = self.arrival_probe.lock().as_ref() {
            self.lock_held_during_arrival.store(probe(), Ordering::SeqCst);
        }
        *self.arrival_status.lock()
    }

    fn query_auto_mount(&self) -> Result<bool, NtStatus> {
        self.record(MountCall::QueryAutoMount);
        *self.auto_mount.lock()
    }

    fn set_auto_mount(&self, enabled: bool) -> NtStatus {
        self.record(MountCall::SetAutoMount(enabled));
        NtStatus::Success
    }

    fn create_mount_point(&self, dcb: &Dcb) -> NtStatus {
        self.record(MountCall::CreateMountPoint(String::from(dcb.mount_point())));
        NtStatus::Success
    }

    fn register_unc_provider(&self, dcb: &Dcb) -> NtStatus {
        self.record(MountCall::RegisterUnc(String::from(dcb.disk_device_name())));
        NtStatus::Success
    }

    fn unmount(&self, dcb: &Dcb) -> NtStatus {
        self.record(MountCall::Unmount(String::from(dcb.disk_device_name())));
        NtStatus::Success
    }
}

/// A change reported to the notifier, with the lock state seen at the time
#[derive(Debug, Clone)]
pub struct NotifyReport {
    pub path: String,
    pub filter: u32,
    pub action: u32,
    pub fcb_shared: bool,
}

pub struct RecordingNotifier {
    reports: Mutex<Vec<NotifyReport>>,
    cleanups: AtomicUsize,
    status: Mutex<NtStatus>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            cleanups: AtomicUsize::new(0),
            status: Mutex::new(NtStatus::Success),
        }
    }
}

impl RecordingNotifier {
    pub fn respond_with(&self, status: NtStatus) {
        *self.status.lock() = status;
    }

    pub fn reports(&self) -> Vec<NotifyReport> {
        self.reports.lock().clone()
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn report_change(&self, fcb: &Fcb, path: &str, completion_filter: u32, action: u32) -> NtStatus {
        self.reports.lock().push(NotifyReport {
            path: String::from(path),
            filter: completion_filter,
            action,
            fcb_shared: fcb.resource.is_acquired_shared(),
        });
        *self.status.lock()
    }

    fn cleanup_waiters(&self, _vcb: &Vcb) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// One request handed to the oplock facility, with the locks held at the time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub code: u32,
    pub count: u32,
    pub vcb_shared: bool,
    pub vcb_exclusive: bool,
    pub fcb_shared: bool,
    pub fcb_exclusive: bool,
}

/// Oplock facility that records delegations and completes with a fixed status
pub struct RecordingOplocks {
    delegations: Mutex<Vec<Delegation>>,
    status: Mutex<NtStatus>,
    parked: Mutex<Vec<Irp>>,
}

impl Default for RecordingOplocks {
    fn default() -> Self {
        Self {
            delegations: Mutex::new(Vec::new()),
            status: Mutex::new(NtStatus::Success),
            parked: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingOplocks {
    /// `Pending` keeps the IRP; anything else completes it
    pub fn respond_with(&self, status: NtStatus) {
        *self.status.lock() = status;
    }

    pub fn delegations(&self) -> Vec<Delegation> {
        self.delegations.lock().clone()
    }
}

impl OplockFacility for RecordingOplocks {
    fn oplock_fsctrl(&self, _oplock: &Oplock, irp: Irp, open_count: u32) -> NtStatus {
        let (vcb_shared, vcb_exclusive, fcb_shared, fcb_exclusive) =
            match resolve(irp.file_object.as_deref()) {
                Ok(resolved) => (
                    resolved.vcb.resource.is_acquired_shared(),
                    resolved.vcb.resource.is_acquired_exclusive(),
                    resolved.fcb.resource.is_acquired_shared(),
                    resolved.fcb.resource.is_acquired_exclusive(),
                ),
                Err(_) => (false, false, false, false),
            };
        self.delegations.lock().push(Delegation {
            code: irp.fs_control_code,
            count: open_count,
            vcb_shared,
            vcb_exclusive,
            fcb_shared,
            fcb_exclusive,
        });

        let status = *self.status.lock();
        if status == NtStatus::Pending {
            self.parked.lock().push(irp);
        } else {
            irp.complete(status, 0);
        }
        status
    }
}

/// Collects the statuses IRPs are completed with
#[derive(Clone, Default)]
pub struct CompletionLog {
    statuses: Arc<Mutex<Vec<NtStatus>>>,
}

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, irp: Irp) -> Irp {
        let statuses = Arc::clone(&self.statuses);
        irp.on_complete(move |io_status| statuses.lock().push(io_status.status))
    }

    pub fn statuses(&self) -> Vec<NtStatus> {
        self.statuses.lock().clone()
    }
}

/// The full set of mocks, shared with the collaborators they back
pub struct Mocks {
    pub io: Arc<MockIo>,
    pub threads: Arc<MockThreads>,
    pub clock: Arc<MockClock>,
    pub mount_manager: Arc<MockMountManager>,
    pub notifier: Arc<RecordingNotifier>,
    pub oplocks: Arc<RecordingOplocks>,
}

impl Mocks {
    pub fn new() -> Self {
        Self {
            io: Arc::new(MockIo::default()),
            threads: Arc::new(MockThreads::new()),
            clock: Arc::new(MockClock::default()),
            mount_manager: Arc::new(MockMountManager::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            oplocks: Arc::new(RecordingOplocks::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            io: self.io.clone(),
            threads: self.threads.clone(),
            clock: self.clock.clone(),
            mount_manager: self.mount_manager.clone(),
            notifier: self.notifier.clone(),
            oplocks: self.oplocks.clone(),
        }
    }
}

const FIXTURE_MOUNT_POINT: &str = "\\DosDevices\\M:";
const FIXTURE_DISK_DEVICE: &str = "\\Device\\Volume{fixture}";

/// A volume already mounted on a started disk device
pub struct Fixture {
    pub global: DriverGlobal,
    pub dcb: Arc<Dcb>,
    pub vcb: Arc<Vcb>,
    pub disk: Arc<DeviceObject>,
    pub volume: Arc<DeviceObject>,
    pub threads: Arc<MockThreads>,
    pub clock: Arc<MockClock>,
    pub mount_manager: Arc<MockMountManager>,
    pub notifier: Arc<RecordingNotifier>,
    pub oplocks: Arc<RecordingOplocks>,
    next_file_object: AtomicU64,
}

impl Fixture {
    pub fn mounted() -> Self {
        Self::build(MountOptions::empty(), 0)
    }

    pub fn mounted_with_gc(interval_ms: u64) -> Self {
        Self::build(MountOptions::empty(), interval_ms)
    }

    pub fn mounted_with_options(options: MountOptions) -> Self {
        Self::build(options, 0)
    }

    fn build(options: MountOptions, gc_interval_ms: u64) -> Self {
        let mocks = Mocks::new();
        let global = DriverGlobal::new(DriverConfig::new(), mocks.collaborators());

        let mut params = DcbParameters::new(FIXTURE_MOUNT_POINT, FIXTURE_DISK_DEVICE);
        params.mount_options = options;
        params.fcb_gc_interval_ms = gc_interval_ms;
        let dcb = Dcb::new(params);
        global.mount_table.insert(dcb.mount_key());

        let disk = DeviceObject::new(
            Some(FIXTURE_DISK_DEVICE),
            device_type::FILE_DEVICE_DISK_FILE_SYSTEM,
            0,
        );
        disk.set_extension(ControlBlock::Dcb(Arc::clone(&dcb)));

        let volume = DeviceObject::new(None, device_type::FILE_DEVICE_DISK_FILE_SYSTEM, 0);
        let vcb = Vcb::new(BlockRef::from(&dcb), &volume, gc_interval_ms);
        volume.set_extension(ControlBlock::Vcb(Arc::clone(&vcb)));
        vcb.set_flag(vcb_flags::VCB_MOUNTED);
        dcb.set_vcb(Arc::clone(&vcb));

        Self {
            global,
            dcb,
            vcb,
            disk,
            volume,
            threads: mocks.threads,
            clock: mocks.clock,
            mount_manager: mocks.mount_manager,
            notifier: mocks.notifier,
            oplocks: mocks.oplocks,
            next_file_object: AtomicU64::new(1),
        }
    }

    /// Open a handle on `name`
    pub fn open(&self, name: &str, is_directory: bool) -> (Arc<FileObject>, Arc<Ccb>) {
        let fcb = self.vcb.open_fcb(name, is_directory);
        let ccb = Ccb::new(ControlBlock::Fcb(fcb));
        let id = self.next_file_object.fetch_add(1, Ordering::Relaxed);
        let file_object = FileObject::new(id, Some(ControlBlock::Ccb(Arc::clone(&ccb))));
        (file_object, ccb)
    }

    /// A user FSCTL on `file` with room for a REQUEST_OPLOCK output buffer
    pub fn fsctl(&self, code: u32, file: &Arc<FileObject>, input: Vec<u8>) -> Irp {
        Irp::user_fs_request(code, Some(Arc::clone(file)), input, REQUEST_OPLOCK_OUTPUT_BUFFER_SIZE)
    }
}

/// A started disk device waiting for its mount request
pub struct MountHarness {
    pub global: Arc<DriverGlobal>,
    pub dcb: Arc<Dcb>,
    pub disk: Arc<DeviceObject>,
    pub vpb: Arc<Vpb>,
    pub io: Arc<MockIo>,
    pub threads: Arc<MockThreads>,
    pub mount_manager: Arc<MockMountManager>,
}

impl MountHarness {
    /// Device registered in the mount table
    pub fn new(params: DcbParameters) -> Self {
        let harness = Self::without_entry(params);
        harness.global.mount_table.insert(harness.dcb.mount_key());
        harness
    }

    /// Device with no mount table entry
    pub fn without_entry(params: DcbParameters) -> Self {
        let mocks = Mocks::new();
        let global = Arc::new(DriverGlobal::new(DriverConfig::new(), mocks.collaborators()));

        let probe = Arc::downgrade(&global);
        mocks.mount_manager.probe_arrival(move || {
            probe
                .upgrade()
                .map_or(false, |global| global.mount_manager_lock.is_acquired_exclusive())
        });

        let disk = DeviceObject::new(
            Some(&params.disk_device_name),
            device_type::FILE_DEVICE_DISK_FILE_SYSTEM,
            0,
        );
        let dcb = Dcb::new(params);
        disk.set_extension(ControlBlock::Dcb(Arc::clone(&dcb)));

        Self {
            global,
            dcb,
            disk,
            vpb: Vpb::new(),
            io: mocks.io,
            threads: mocks.threads,
            mount_manager: mocks.mount_manager,
        }
    }

    pub fn mount_irp(&self) -> Irp {
        Irp::mount_volume(Arc::clone(&self.disk), Arc::clone(&self.vpb))
    }
}
