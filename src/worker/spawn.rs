//! Worker subprocess spawning.
//!
//! A worker is the same executable started in hidden `worker` mode. Everything
//! it needs to join the pool travels in one JSON environment variable; the
//! control channel is the child's stdin/stdout and its stderr is inherited so
//! worker logs land next to the manager's.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use super::WorkerId;
use crate::address::WorkerAddress;
use crate::error::{ClusterError, Result};

/// Environment variable carrying the JSON [`WorkerBootstrap`].
pub const BOOTSTRAP_ENV: &str = "TIDEPOOL_WORKER_BOOTSTRAP";

/// Everything a worker needs to join the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub worker_id: WorkerId,
    /// Incarnation number; unique across the pool's lifetime.
    pub generation: u64,
    pub pool_size: usize,
    /// Address to bind the private listener at.
    pub address: WorkerAddress,
    /// Shared counter store file.
    pub counters: PathBuf,
    /// Shared latency ring file.
    pub latency: PathBuf,
    /// Worker that owns the metrics aggregator.
    pub aggregator_id: WorkerId,
    pub aggregate_interval_ms: u64,
    pub notify_interval_ms: u64,
}

impl WorkerBootstrap {
    /// Read the bootstrap from [`BOOTSTRAP_ENV`].
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(BOOTSTRAP_ENV).map_err(|_| {
            ClusterError::Bootstrap(format!(
                "{} is not set; worker mode is started by `tidepool serve`",
                BOOTSTRAP_ENV
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ClusterError::Bootstrap(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this worker runs the metrics aggregator.
    pub fn is_aggregator(&self) -> bool {
        self.worker_id == self.aggregator_id
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_millis(self.aggregate_interval_ms)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }
}

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerLauncher {
    /// Launch `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the running binary in worker mode.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            ClusterError::Worker(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::new(exe).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Start a worker with the given bootstrap.
    pub fn spawn(&self, bootstrap: &WorkerBootstrap) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(BOOTSTRAP_ENV, bootstrap.to_json()?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| ClusterError::Spawn {
            id: bootstrap.worker_id,
            message: format!("{}: {}", self.program.display(), e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn bootstrap() -> WorkerBootstrap {
        WorkerBootstrap {
            worker_id: WorkerId(1),
            generation: 4,
            pool_size: 3,
            address: WorkerAddress::loopback(),
            counters: PathBuf::from("/tmp/tp/counters.shm"),
            latency: PathBuf::from("/tmp/tp/latency.shm"),
            aggregator_id: WorkerId(0),
            aggregate_interval_ms: 1000,
            notify_interval_ms: 2000,
        }
    }

    #[test]
    fn test_bootstrap_json() {
        let b = bootstrap();
        let json = b.to_json().unwrap();
        assert!(json.starts_with(r#"{"worker_id":1,"generation":4"#));
        assert_eq!(WorkerBootstrap::from_json(&json).unwrap(), b);
        assert!(!b.is_aggregator());
        assert_eq!(b.notify_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_bad_bootstrap_is_reported() {
        let err = WorkerBootstrap::from_json("{}").unwrap_err();
        assert!(matches!(err, ClusterError::Bootstrap(_)));
    }

    #[tokio::test]
    async fn test_spawn_passes_bootstrap_in_env() {
        let launcher = WorkerLauncher::new("sh")
            .arg("-c")
            .arg("printf '%s|%s' \"$TIDEPOOL_WORKER_BOOTSTRAP\" \"$EXTRA\"")
            .env("EXTRA", "yes");
        let mut child = launcher.spawn(&bootstrap()).unwrap();

        let mut out = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        child.wait().await.unwrap();

        let (json, extra) = out.split_once('|').unwrap();
        assert_eq!(WorkerBootstrap::from_json(json).unwrap(), bootstrap());
        assert_eq!(extra, "yes");
    }

    #[test]
    fn test_spawn_missing_program() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let err = WorkerLauncher::new("/nonexistent/tidepool-worker")
            .spawn(&bootstrap())
            .unwrap_err();
        assert!(matches!(err, ClusterError::Spawn { id: WorkerId(1), .. }));
    }
}
