//! Path utilities for pool state.
//!
//! Each pool gets a private state directory holding the shared-memory region
//! files and, with the unix transport, the workers' sockets.

use std::path::{Path, PathBuf};

use crate::worker::WorkerId;

/// Shared counter store filename.
pub const COUNTERS_FILENAME: &str = "counters.shm";

/// Shared latency ring filename.
pub const LATENCY_FILENAME: &str = "latency.shm";

/// Prefix of per-pool state directories.
pub const STATE_DIR_PREFIX: &str = "tidepool-";

/// Get the base directory pool state directories are created in.
///
/// Prefers the user's runtime directory (`$XDG_RUNTIME_DIR` on Linux, which
/// is memory-backed and private), falling back to the system temp directory.
pub fn state_base_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

pub fn counters_path(state_dir: &Path) -> PathBuf {
    state_dir.join(COUNTERS_FILENAME)
}

pub fn latency_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LATENCY_FILENAME)
}

/// Socket for one worker incarnation.
///
/// The generation keeps a replacement from racing its predecessor's cleanup.
pub fn worker_socket_path(state_dir: &Path, id: WorkerId, generation: u64) -> PathBuf {
    state_dir.join(format!("worker-{}-{}.sock", id, generation))
}
