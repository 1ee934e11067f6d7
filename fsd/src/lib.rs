//! File system driver core for a user-mode backed volume
//!
//! The kernel half of a file system whose operations are served by a
//! user-mode process. This crate holds the parts that do not touch user
//! mode: oplock arbitration, file system control routing and volume
//! mounting, together with the control blocks they work on.
//!
//! # Architecture Overview
//!
//! - **blocks** - DCB/VCB/FCB/CCB control blocks and checked resolution
//! - **fsctl** - IRP_MJ_FILE_SYSTEM_CONTROL dispatch, oplock FSCTLs, mount
//! - **fsrtl** - Oplock package, byte-range locks, change notification
//! - **ex** - Executive resources and background tasks
//! - **io** - IRPs, device objects, VPBs, file objects
//! - **workers** - FCB garbage collector and liveness checker
//! - **global** - Mount table and host collaborators
//!
//! # Lock Order
//!
//! DCB before VCB before FCB. The mount-manager lock is taken with no
//! block resource held.
//!
//! Host services (device creation, threads, time, the mount manager and
//! the oplock and notification packages) are reached through the traits
//! in [`global::Collaborators`].

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod blocks;
pub mod config;
pub mod ex;
pub mod fsctl;
pub mod fsrtl;
pub mod global;
pub mod io;
pub mod mountmgr;
pub mod status;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use config::{DcbParameters, DriverConfig, MountOptions};
pub use fsctl::dispatch_file_system_control;
pub use fsctl::mount::{mount_volume, MountFailure, MountStage};
pub use global::{Collaborators, DriverGlobal};
pub use status::NtStatus;
