//! Worker processes.
//!
//! The manager side spawns workers ([`spawn`]) and talks to them through a
//! [`handle::WorkerHandle`]; the worker side runs an [`app::Application`]
//! inside [`runtime::run_worker`]. Both ends speak the newline-delimited JSON
//! [`protocol`] over the child's stdin/stdout.

pub mod app;
pub mod handle;
pub mod ipc;
pub mod protocol;
pub mod runtime;
pub mod signals;
pub mod spawn;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use app::{Application, HelloApp};
pub use handle::{WorkerEvent, WorkerHandle, WorkerState};
pub use protocol::{Action, ControlMessage};
pub use runtime::{WorkerContext, WorkerExit, run_worker};
pub use signals::TerminationReason;
pub use spawn::{BOOTSTRAP_ENV, WorkerBootstrap, WorkerLauncher};

/// Pool slot index. A replacement worker inherits the id of the one it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
