//! File System Runtime Library
//!
//! Support packages the file system delegates to:
//! - `filelock`: byte-range lock table with the oplock queries
//! - `oplock`: opportunistic lock grant/break bookkeeping
//! - `notify`: directory change notification

pub mod filelock;
pub mod notify;
pub mod oplock;

pub use filelock::{FileLock, FileLockInfo, LockOutcome};
pub use notify::{ChangeNotifier, DirNotifyList, FsRtlNotifier, NotifySync};
pub use oplock::{FsRtlOplockPackage, Oplock, OplockFacility, OplockType, RequestOplockInput};
