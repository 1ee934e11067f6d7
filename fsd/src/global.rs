//! Driver-global state
//!
//! # Mount Table
//! Correlates a disk device (device name, UNC name, session) with the volume
//! device created for it at mount time. Entries are registered when user
//! mode starts a device and looked up by the mount sequencer under the
//! DCB's resource.
//!
//! # Collaborators
//! Host services the driver core calls out to. They are trait objects so
//! the core runs unchanged against the real kernel or against mocks.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{DriverConfig, MountOptions};
use crate::ex::{Clock, EResource, SystemThreads};
use crate::fsrtl::notify::ChangeNotifier;
use crate::fsrtl::oplock::OplockFacility;
use crate::io::device::{DeviceObject, IoManager};
use crate::mountmgr::MountManager;

/// Identity of a mount entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountKey {
    pub device_name: String,
    pub unc_name: String,
    pub session_id: u32,
}

impl MountKey {
    pub fn new(device_name: &str, unc_name: &str, session_id: u32) -> Self {
        Self {
            device_name: String::from(device_name),
            unc_name: String::from(unc_name),
            session_id,
        }
    }
}

/// Mount table entry
#[derive(Debug)]
pub struct MountEntry {
    pub key: MountKey,
    /// Volume device created at mount time
    pub volume_device: Option<Arc<DeviceObject>>,
    pub mount_options: MountOptions,
}

pub type SharedMountEntry = Arc<Mutex<MountEntry>>;

/// Process-wide mount table
#[derive(Default)]
pub struct MountTable {
    entries: Mutex<Vec<SharedMountEntry>>,
}

impl MountTable {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register an entry for a started device. Returns false if one with
    /// the same key already exists.
    pub fn insert(&self, key: MountKey) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|entry| entry.lock().key == key) {
            log::warn!("[MOUNT] entry for {} already registered", key.device_name);
            return false;
        }
        entries.push(Arc::new(Mutex::new(MountEntry {
            key,
            volume_device: None,
            mount_options: MountOptions::empty(),
        })));
        true
    }

    /// Look up a pre-registered entry
    pub fn find_entry(&self, key: &MountKey) -> Option<SharedMountEntry> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.lock().key == *key)
            .cloned()
    }

    pub fn remove(&self, key: &MountKey) -> Option<SharedMountEntry> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|entry| entry.lock().key == *key)?;
        Some(entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host services used by the driver core
#[derive(Clone)]
pub struct Collaborators {
    pub io: Arc<dyn IoManager>,
    pub threads: Arc<dyn SystemThreads>,
    pub clock: Arc<dyn Clock>,
    pub mount_manager: Arc<dyn MountManager>,
    pub notifier: Arc<dyn ChangeNotifier>,
    pub oplocks: Arc<dyn OplockFacility>,
}

/// State shared by every dispatch routine
pub struct DriverGlobal {
    pub config: DriverConfig,
    pub mount_table: MountTable,
    /// Serializes mount manager arrival notifications
    pub mount_manager_lock: EResource,
    pub collab: Collaborators,
}

impl DriverGlobal {
    pub fn new(config: DriverConfig, collab: Collaborators) -> Self {
        Self {
            config,
            mount_table: MountTable::new(),
            mount_manager_lock: EResource::new(),
            collab,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_table_lookup() {
        let table = MountTable::new();
        let key = MountKey::new("\\Device\\Volume{1}", "", 1);

        assert!(table.find_entry(&key).is_none());
        assert!(table.insert(key.clone()));
        assert!(!table.insert(key.clone()));
        assert_eq!(table.len(), 1);

        // Same device in another session is a different entry
        assert!(table.find_entry(&MountKey::new("\\Device\\Volume{1}", "", 2)).is_none());

        let entry = table.find_entry(&key).unwrap();
        entry.lock().mount_options = MountOptions::REMOVABLE;
        assert_eq!(table.find_entry(&key).unwrap().lock().mount_options, MountOptions::REMOVABLE);

        assert!(table.remove(&key).is_some());
        assert!(table.is_empty());
    }
}
