//! Manager-side handle to one worker process.
//!
//! Attaching a child spawns three tasks: a reader that forwards control
//! messages from the worker's stdout, a writer that drains queued messages to
//! its stdin, and a waiter that reports the exit. Events are tagged with the
//! worker's id and generation so late events from a replaced worker can be
//! told apart from the current one.

use std::time::Instant;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use super::WorkerId;
use super::ipc::{LineReader, LineWriter, forward_outbox};
use super::protocol::ControlMessage;
use super::signals::{TerminationReason, analyze_exit_status};
use crate::address::WorkerAddress;
use crate::error::{ClusterError, Result};

/// Lifecycle of a worker as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet listening.
    Spawning,
    /// Listening and eligible for routing.
    Serving,
    /// Asked to shut down.
    Stopping,
}

/// Something a worker did.
#[derive(Debug)]
pub enum WorkerEvent {
    Message {
        id: WorkerId,
        generation: u64,
        message: ControlMessage,
    },
    Exited {
        id: WorkerId,
        generation: u64,
        reason: TerminationReason,
    },
}

/// A running worker process.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) generation: u64,
    pub(crate) pid: Option<u32>,
    pub(crate) state: WorkerState,
    pub(crate) address: Option<WorkerAddress>,
    pub(crate) started_at: Instant,
    control: mpsc::UnboundedSender<ControlMessage>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    /// Take over a freshly spawned child and start its I/O tasks.
    pub fn attach(
        id: WorkerId,
        generation: u64,
        mut child: Child,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self> {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ClusterError::Spawn {
                id,
                message: "control pipes were not captured".to_string(),
            });
        };
        let pid = child.id();

        let (control, outbox) = mpsc::unbounded_channel();
        tokio::spawn(forward_outbox(LineWriter::new(stdin), outbox));

        let messages = events.clone();
        tokio::spawn(async move {
            let mut reader = LineReader::new(stdout);
            loop {
                match reader.recv().await {
                    Ok(Some(message)) => {
                        let event = WorkerEvent::Message {
                            id,
                            generation,
                            message,
                        };
                        if messages.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(ClusterError::Json(e)) => {
                        tracing::warn!(worker_id = %id, error = %e, "Ignoring malformed control message");
                    }
                    Err(e) => {
                        tracing::debug!(worker_id = %id, error = %e, "Control channel read failed");
                        break;
                    }
                }
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            // A dropped handle also resolves `kill_rx`.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let reason = match status {
                Ok(status) => analyze_exit_status(status),
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "Failed to wait for worker");
                    TerminationReason::Unknown
                }
            };
            let _ = events.send(WorkerEvent::Exited {
                id,
                generation,
                reason,
            });
        });

        Ok(Self {
            id,
            generation,
            pid,
            state: WorkerState::Spawning,
            address: None,
            started_at: Instant::now(),
            control,
            kill: Some(kill_tx),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn address(&self) -> Option<&WorkerAddress> {
        self.address.as_ref()
    }

    /// Queue a control message. Returns false once the worker's stdin is gone.
    pub fn send(&self, message: ControlMessage) -> bool {
        self.control.send(message).is_ok()
    }

    /// Send SIGTERM.
    pub fn terminate(&self) -> bool {
        self.signal(Signal::SIGTERM)
    }

    /// Kill the process.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }

    fn signal(&self, signal: Signal) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(worker_id = %self.id, pid, error = %e, "Failed to signal worker");
                false
            }
        }
    }
}
