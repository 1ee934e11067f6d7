//! Executive support: resources and background tasks

pub mod resource;
pub mod task;

pub use resource::{AcquireMode, EResource, ResourceGuard};
pub use task::{BackgroundTask, Clock, SystemThreads, TaskHandle, TaskState, ThreadBody};
