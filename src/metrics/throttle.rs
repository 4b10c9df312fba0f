//! Trailing-edge throttle.
//!
//! The first trigger arms a timer; triggers that arrive before it fires are
//! absorbed, and the action runs once when the interval ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Runs an action at most once per interval, after the burst that caused it.
#[derive(Debug)]
pub struct Throttle {
    notify: Arc<Notify>,
    armed: Arc<AtomicBool>,
    fired: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Throttle {
    /// Start the throttle task. Must be called inside a tokio runtime.
    pub fn spawn<F>(interval: Duration, mut action: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let armed = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn({
            let notify = notify.clone();
            let armed = armed.clone();
            let fired = fired.clone();
            async move {
                loop {
                    notify.notified().await;
                    tokio::time::sleep(interval).await;
                    // Disarm before running so a trigger racing the action
                    // schedules another run.
                    armed.store(false, Ordering::Release);
                    action();
                    fired.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        Self {
            notify,
            armed,
            fired,
            task,
        }
    }

    /// Request a run at the end of the current interval.
    pub fn trigger(&self) {
        if !self.armed.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Number of times the action has run.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
