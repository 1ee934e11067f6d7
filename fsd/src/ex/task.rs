//! Background Tasks
//!
//! The driver runs exactly two kinds of dedicated threads: the per-volume
//! FCB garbage collector and the per-device liveness checker. Each one lives
//! in a [`BackgroundTask`] slot owned by the block it serves, so whether it
//! was started is recorded in the block instead of being re-derived from
//! configuration.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted --start()--> Running --stop()/body returns--> Stopped
//! ```
//!
//! Starting a task that is not in `NotStarted` is a no-op.
//!
//! Thread creation and time are host services, reached through
//! [`SystemThreads`] and [`Clock`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::status::NtStatus;

/// Body of a system thread
pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// PsCreateSystemThread and friends
pub trait SystemThreads: Send + Sync {
    /// Start a detached kernel thread running `body`
    fn create_system_thread(&self, name: &'static str, body: ThreadBody) -> Result<(), NtStatus>;

    /// Run `work` in the system process context and wait for it
    fn run_as_system(&self, work: &mut dyn FnMut());
}

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary epoch
    fn now_ms(&self) -> u64;

    /// Block the calling thread
    fn sleep_ms(&self, ms: u64);
}

/// Lifecycle state of a background task
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted = 0,
    Running = 1,
    Stopped = 2,
}

impl TaskState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => TaskState::NotStarted,
            1 => TaskState::Running,
            _ => TaskState::Stopped,
        }
    }
}

/// Handle given to a task body to observe stop requests
#[derive(Clone)]
pub struct TaskHandle {
    stop: Arc<AtomicBool>,
}

impl TaskHandle {
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// An owned, start-once background task slot
pub struct BackgroundTask {
    name: &'static str,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
}

impl BackgroundTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(AtomicU8::new(TaskState::NotStarted as u8)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Start the task on a new system thread.
    ///
    /// Returns `Ok(true)` if this call started it, `Ok(false)` if it was
    /// already started. A thread creation failure leaves it `NotStarted`.
    pub fn start<F>(&self, threads: &dyn SystemThreads, body: F) -> Result<bool, NtStatus>
    where
        F: FnOnce(TaskHandle) + Send + 'static,
    {
        if self
            .state
            .compare_exchange(
                TaskState::NotStarted as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            log::debug!("[TASK] {} already started", self.name);
            return Ok(false);
        }

        let handle = TaskHandle {
            stop: Arc::clone(&self.stop),
        };
        let state = Arc::clone(&self.state);
        let thread_body: ThreadBody = Box::new(move || {
            body(handle);
            state.store(TaskState::Stopped as u8, Ordering::Release);
        });

        if let Err(status) = threads.create_system_thread(self.name, thread_body) {
            log::error!("[TASK] failed to start {}: {}", self.name, status);
            self.state.store(TaskState::NotStarted as u8, Ordering::Release);
            return Err(status);
        }

        log::debug!("[TASK] {} started", self.name);
        Ok(true)
    }

    /// Ask the task to stop. The body observes this on its next wakeup.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if self.state() == TaskState::NotStarted {
            self.state.store(TaskState::Stopped as u8, Ordering::Release);
        }
    }
}

impl core::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockThreads;

    #[test]
    fn test_start_once() {
        let threads = MockThreads::new();
        let task = BackgroundTask::new("DokanFcbGarbageCollector");
        assert_eq!(task.state(), TaskState::NotStarted);

        assert_eq!(task.start(&threads, |_| {}), Ok(true));
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(task.start(&threads, |_| {}), Ok(false));
        assert_eq!(threads.started(), ["DokanFcbGarbageCollector"]);

        threads.run_pending();
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[test]
    fn test_stop_is_observed() {
        let threads = MockThreads::new();
        let task = BackgroundTask::new("DokanCheckThread");
        let seen = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&seen);

        task.start(&threads, move |handle| sink.store(handle.stop_requested(), Ordering::SeqCst))
            .unwrap();
        task.stop();
        threads.run_pending();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_start_stays_not_started() {
        let threads = MockThreads::failing(NtStatus::InsufficientResources);
        let task = BackgroundTask::new("DokanCheckThread");
        assert_eq!(task.start(&threads, |_| {}), Err(NtStatus::InsufficientResources));
        assert_eq!(task.state(), TaskState::NotStarted);
    }
}
