//! Startup barrier: opens once every slot has reported `listening`.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{ClusterError, Result};
use crate::worker::WorkerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Waiting,
    Open,
    Failed {
        id: WorkerId,
        attempts: u32,
        reason: String,
    },
}

/// Counts distinct ready workers against the expected pool size.
#[derive(Debug)]
pub struct ReadinessGate {
    expected: usize,
    ready: Mutex<HashSet<WorkerId>>,
    state: watch::Sender<GateState>,
}

impl ReadinessGate {
    pub fn new(expected: usize) -> Self {
        let initial = if expected == 0 {
            GateState::Open
        } else {
            GateState::Waiting
        };
        Self {
            expected,
            ready: Mutex::new(HashSet::new()),
            state: watch::Sender::new(initial),
        }
    }

    /// Record that `id` is listening. Returns true if this opened the gate.
    /// Repeated reports from one slot count once.
    pub fn mark_ready(&self, id: WorkerId) -> bool {
        let ready = {
            let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
            ready.insert(id);
            ready.len()
        };
        if ready < self.expected {
            return false;
        }
        self.state.send_if_modified(|state| {
            if *state == GateState::Waiting {
                *state = GateState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Withdraw `id` after its worker exits. No effect once the gate has
    /// opened.
    pub fn unmark(&self, id: WorkerId) {
        if *self.state.borrow() != GateState::Waiting {
            return;
        }
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Fail startup. Ignored once the gate has opened or already failed.
    pub fn fail(&self, id: WorkerId, attempts: u32, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.send_if_modified(|state| {
            if *state == GateState::Waiting {
                *state = GateState::Failed {
                    id,
                    attempts,
                    reason,
                };
                true
            } else {
                false
            }
        });
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow() == GateState::Open
    }

    pub fn ready_count(&self) -> usize {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait until the gate opens, fails, or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| *state != GateState::Waiting)
                .await
                .map(|state| state.clone())
        })
        .await;

        match outcome {
            Ok(Ok(GateState::Open)) => Ok(()),
            Ok(Ok(GateState::Failed {
                id,
                attempts,
                reason,
            })) => Err(ClusterError::StartupFailed {
                id,
                attempts,
                reason,
            }),
            Ok(Ok(GateState::Waiting)) | Ok(Err(_)) | Err(_) => {
                Err(ClusterError::ReadinessTimeout {
                    ready: self.ready_count(),
                    expected: self.expected,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_opens_after_all_distinct_workers() {
        let gate = Arc::new(ReadinessGate::new(3));
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait(Duration::from_secs(5)).await }
        });

        assert!(!gate.mark_ready(WorkerId(0)));
        assert!(!gate.mark_ready(WorkerId(0)));
        assert!(!gate.mark_ready(WorkerId(1)));
        assert!(!gate.is_open());
        assert_eq!(gate.ready_count(), 2);

        assert!(gate.mark_ready(WorkerId(2)));
        assert!(gate.is_open());
        waiter.await.unwrap().unwrap();

        // Later reports (respawns) do not reopen anything.
        assert!(!gate.mark_ready(WorkerId(1)));
    }

    #[tokio::test]
    async fn test_exited_worker_no_longer_counts() {
        let gate = ReadinessGate::new(2);
        gate.mark_ready(WorkerId(0));
        gate.unmark(WorkerId(0));
        assert!(!gate.mark_ready(WorkerId(1)));
        assert_eq!(gate.ready_count(), 1);
        assert!(!gate.is_open());

        // The replacement reports and the gate opens.
        assert!(gate.mark_ready(WorkerId(0)));
        gate.unmark(WorkerId(1));
        assert_eq!(gate.ready_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let gate = ReadinessGate::new(2);
        gate.mark_ready(WorkerId(0));
        gate.fail(WorkerId(1), 4, "exited with code 3");

        match gate.wait(Duration::from_secs(5)).await {
            Err(ClusterError::StartupFailed { id, attempts, reason }) => {
                assert_eq!(id, WorkerId(1));
                assert_eq!(attempts, 4);
                assert!(reason.contains("code 3"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_after_open_is_ignored() {
        let gate = ReadinessGate::new(1);
        gate.mark_ready(WorkerId(0));
        gate.fail(WorkerId(0), 1, "late");
        assert!(gate.is_open());
        gate.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_progress() {
        let gate = ReadinessGate::new(3);
        gate.mark_ready(WorkerId(2));
        match gate.wait(Duration::from_secs(30)).await {
            Err(ClusterError::ReadinessTimeout { ready, expected }) => {
                assert_eq!((ready, expected), (1, 3));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
