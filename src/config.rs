//! Pool configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cluster::RestartPolicy;
use crate::error::{ClusterError, Result};
use crate::worker::WorkerId;

/// How workers expose their private listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerTransport {
    /// Filesystem socket under the state directory.
    #[default]
    Unix,
    /// Loopback TCP with an OS-assigned port.
    Tcp,
}

impl FromStr for WorkerTransport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unix" => Ok(Self::Unix),
            "tcp" => Ok(Self::Tcp),
            _ => Err(format!("Unknown worker transport: {}. Use unix or tcp", s)),
        }
    }
}

impl std::fmt::Display for WorkerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix => write!(f, "unix"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Configuration for a [`ClusterManager`](crate::cluster::ClusterManager).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of worker processes.
    pub pool_size: usize,
    pub transport: WorkerTransport,
    /// Parent of the pool's private state directory (default: runtime dir).
    pub state_dir: Option<PathBuf>,
    /// Slots in the shared counter table.
    pub counter_capacity: usize,
    /// Samples kept in the latency ring.
    pub latency_capacity: usize,
    /// Failed starts allowed per slot before `start` gives up.
    pub startup_retries: u32,
    /// Deadline for every worker to report `listening`.
    pub startup_timeout: Duration,
    pub restart: RestartPolicy,
    /// Time workers get to exit after `shutdown` before escalation.
    pub shutdown_timeout: Duration,
    /// Worker hosting the metrics aggregator.
    pub aggregator: WorkerId,
    pub aggregate_interval: Duration,
    /// Throttle for `metrics.updated` notifications from workers.
    pub notify_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            transport: WorkerTransport::default(),
            state_dir: None,
            counter_capacity: 4096,
            latency_capacity: 10_000,
            startup_retries: 3,
            startup_timeout: Duration::from_secs(30),
            restart: RestartPolicy::default(),
            shutdown_timeout: Duration::from_secs(5),
            aggregator: WorkerId(0),
            aggregate_interval: Duration::from_secs(1),
            notify_interval: Duration::from_secs(2),
        }
    }
}

/// Available parallelism minus one for the manager, at least 1.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl ClusterConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_transport(mut self, transport: WorkerTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = Some(dir);
        self
    }

    /// Check invariants the manager relies on.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(ClusterError::Config("pool size must be at least 1".into()));
        }
        if self.aggregator.0 >= self.pool_size {
            return Err(ClusterError::Config(format!(
                "aggregator worker {} is outside a pool of {}",
                self.aggregator, self.pool_size
            )));
        }
        // Every status code and a handful of agents must fit.
        if self.counter_capacity < 16 {
            return Err(ClusterError::Config(
                "counter capacity must be at least 16".into(),
            ));
        }
        if self.latency_capacity == 0 {
            return Err(ClusterError::Config(
                "latency capacity must be at least 1".into(),
            ));
        }
        if self.startup_timeout.is_zero() || self.shutdown_timeout.is_zero() {
            return Err(ClusterError::Config("timeouts must be non-zero".into()));
        }
        if self.aggregate_interval.is_zero() || self.notify_interval.is_zero() {
            return Err(ClusterError::Config(
                "metrics intervals must be non-zero".into(),
            ));
        }
        if self.restart.base_backoff > self.restart.max_backoff {
            return Err(ClusterError::Config(
                "base backoff exceeds max backoff".into(),
            ));
        }
        Ok(())
    }
}
