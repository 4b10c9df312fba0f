//! tidepool - multi-process worker pool.
//!
//! A manager process owns a public TCP listener and a pool of worker
//! processes. Each inbound connection goes to the less loaded of two randomly
//! sampled workers and is proxied byte-for-byte. Workers share request
//! counters and a latency ring through memory-mapped regions, and talk to the
//! manager over a line-delimited JSON control channel.
//!
//! Unsafe code is confined to [`shm`], which maps the shared regions.

#![deny(unsafe_code)]

pub mod address;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod paths;
pub mod shm;
pub mod worker;

pub use address::WorkerAddress;
pub use cluster::{ClusterManager, LoadBalancer, PoolStatus};
pub use config::{ClusterConfig, WorkerTransport};
pub use error::{ClusterError, Result};
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use shm::{LatencyRingBuffer, SharedCounterStore};
pub use worker::{Application, HelloApp, WorkerContext, WorkerId, WorkerLauncher};
