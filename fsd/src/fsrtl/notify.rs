//! Directory Change Notification Support
//!
//! Applications watch directories for changes and receive notifications
//! when files are created, modified, or deleted. Each volume keeps a
//! [`DirNotifyList`] of watches guarded by its [`NotifySync`].
//!
//! User mode pushes changes it made behind the driver's back through
//! `FSCTL_NOTIFY_PATH`; those land in [`ChangeNotifier::report_change`].

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::blocks::{Fcb, Vcb};
use crate::status::NtStatus;

/// Maximum notifications buffered per watch
const MAX_BUFFERED_NOTIFICATIONS: usize = 64;

/// File action codes for notifications
pub mod file_action {
    pub const FILE_ACTION_ADDED: u32 = 0x0000_0001;
    pub const FILE_ACTION_REMOVED: u32 = 0x0000_0002;
    pub const FILE_ACTION_MODIFIED: u32 = 0x0000_0003;
    pub const FILE_ACTION_RENAMED_OLD_NAME: u32 = 0x0000_0004;
    pub const FILE_ACTION_RENAMED_NEW_NAME: u32 = 0x0000_0005;
}

/// Notification filter flags
pub mod notify_filter {
    pub const FILE_NOTIFY_CHANGE_FILE_NAME: u32 = 0x0000_0001;
    pub const FILE_NOTIFY_CHANGE_DIR_NAME: u32 = 0x0000_0002;
    pub const FILE_NOTIFY_CHANGE_ATTRIBUTES: u32 = 0x0000_0004;
    pub const FILE_NOTIFY_CHANGE_SIZE: u32 = 0x0000_0008;
    pub const FILE_NOTIFY_CHANGE_LAST_WRITE: u32 = 0x0000_0010;
}

/// A single notification entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEntry {
    /// File action (added, removed, modified, etc.)
    pub action: u32,
    /// Notification filter that triggered this
    pub filter: u32,
    /// Name relative to the watched directory
    pub name: String,
}

/// Notification synchronization object
#[derive(Default)]
pub struct NotifySync {
    mutex: Mutex<()>,
}

impl NotifySync {
    pub const fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
        }
    }

    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }
}

/// Directory change notification watch
struct NotifyChange {
    /// Handle that registered the watch
    owner: u64,
    directory: String,
    watch_subtree: bool,
    completion_filter: u32,
    notifications: VecDeque<NotifyEntry>,
}

impl NotifyChange {
    /// Name of `target` relative to the watched directory, if it is watched
    fn relative_name<'a>(&self, target: &'a str) -> Option<&'a str> {
        let remaining = target.strip_prefix(self.directory.as_str())?;
        let remaining = if self.directory.ends_with('\\') {
            remaining
        } else {
            // `\dir` must not match the sibling `\dirx`
            remaining.strip_prefix('\\')?
        };
        if remaining.is_empty() {
            return None;
        }
        if !self.watch_subtree && remaining.contains('\\') {
            return None;
        }
        Some(remaining)
    }
}

/// Watches registered on one volume
#[derive(Default)]
pub struct DirNotifyList {
    watches: Mutex<Vec<NotifyChange>>,
}

impl DirNotifyList {
    pub const fn new() -> Self {
        Self {
            watches: Mutex::new(Vec::new()),
        }
    }

    /// Register a directory change notification watch
    pub fn change_directory(&self, owner: u64, directory: &str, watch_subtree: bool, completion_filter: u32) {
        self.watches.lock().push(NotifyChange {
            owner,
            directory: String::from(directory),
            watch_subtree,
            completion_filter,
            notifications: VecDeque::new(),
        });
    }

    /// Buffer a change on every matching watch. Returns the number of
    /// watches notified.
    pub fn full_report_change(&self, full_target_name: &str, filter_match: u32, action: u32) -> usize {
        let mut delivered = 0;
        for watch in self.watches.lock().iter_mut() {
            if watch.completion_filter & filter_match == 0 {
                continue;
            }
            let Some(name) = watch.relative_name(full_target_name) else {
                continue;
            };
            if watch.notifications.len() == MAX_BUFFERED_NOTIFICATIONS {
                watch.notifications.pop_front();
            }
            watch.notifications.push_back(NotifyEntry {
                action,
                filter: filter_match,
                name: String::from(name),
            });
            delivered += 1;
        }
        delivered
    }

    /// Next buffered notification of `owner`'s watch
    pub fn next_notification(&self, owner: u64) -> Option<NotifyEntry> {
        self.watches
            .lock()
            .iter_mut()
            .find(|watch| watch.owner == owner)
            .and_then(|watch| watch.notifications.pop_front())
    }

    /// Remove the watch of one handle
    pub fn cleanup(&self, owner: u64) {
        self.watches.lock().retain(|watch| watch.owner != owner);
    }

    /// Drop every watch
    pub fn cleanup_all(&self) -> usize {
        let mut watches = self.watches.lock();
        let count = watches.len();
        watches.clear();
        count
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }
}

/// Change notification collaborator
pub trait ChangeNotifier: Send + Sync {
    /// Report a change to `path` on the volume of `fcb`
    fn report_change(&self, fcb: &Fcb, path: &str, completion_filter: u32, action: u32) -> NtStatus;

    /// Release every change notification waiter of the volume
    fn cleanup_waiters(&self, vcb: &Vcb);
}

/// Default notifier backed by the volume's directory notify list
#[derive(Debug, Default)]
pub struct FsRtlNotifier;

impl FsRtlNotifier {
    /// A reportable name is absolute and has a final component
    fn validate_name(path: &str) -> Result<(), NtStatus> {
        if !path.starts_with('\\') || path.contains('\0') {
            return Err(NtStatus::ObjectNameInvalid);
        }
        match path.rfind('\\') {
            Some(index) if index + 1 < path.len() || path.len() == 1 => Ok(()),
            _ => Err(NtStatus::ObjectNameInvalid),
        }
    }
}

impl ChangeNotifier for FsRtlNotifier {
    fn report_change(&self, fcb: &Fcb, path: &str, completion_filter: u32, action: u32) -> NtStatus {
        if let Err(status) = Self::validate_name(path) {
            log::warn!("[NOTIFY] rejecting malformed name \"{}\"", path);
            return status;
        }
        let vcb = match fcb.vcb() {
            Ok(vcb) => vcb,
            Err(status) => return status,
        };

        let _sync = vcb.notify_sync().acquire();
        let delivered = vcb
            .dir_notify_list()
            .full_report_change(path, completion_filter, action);
        log::trace!("[NOTIFY] \"{}\" action {} delivered to {} watch(es)", path, action, delivered);
        NtStatus::Success
    }

    fn cleanup_waiters(&self, vcb: &Vcb) {
        let _sync = vcb.notify_sync().acquire();
        let released = vcb.dir_notify_list().cleanup_all();
        log::info!("[NOTIFY] released {} change notification waiter(s)", released);
    }
}
