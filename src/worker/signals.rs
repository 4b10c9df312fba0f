//! Exit analysis for worker processes.
//!
//! Decides whether a worker left on purpose (no respawn) or crashed.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Worker exit code: clean exit.
pub const EXIT_OK: i32 = 0;
/// Worker exit code: stopped by a shutdown request or SIGTERM.
pub const EXIT_SHUTDOWN: i32 = 1;
/// Worker exit code: unrecoverable runtime error.
pub const EXIT_FAILURE: i32 = 2;
/// Worker exit code: the private listener could not be bound.
pub const EXIT_BIND_FAILED: i32 = 3;

/// Why a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// The process never started.
    SpawnFailed(String),
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// A deliberate exit: code 0 or 1. The slot is not refilled.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::Exited(EXIT_OK) | Self::Exited(EXIT_SHUTDOWN))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(EXIT_BIND_FAILED) => {
                format!("exited with code {} (bind failed)", EXIT_BIND_FAILED)
            }
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::SpawnFailed(message) => format!("failed to spawn: {}", message),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }
    match status.signal().map(Signal::try_from) {
        Some(Ok(signal)) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}
