//! Request metrics shared by every worker.
//!
//! Workers record each request into the shared counter store and latency
//! ring, then notify the aggregator. The aggregator (one designated worker)
//! turns shared memory into a [`MetricsSnapshot`] at most once per interval
//! and publishes it on a watch channel.

pub mod agent;
mod throttle;

pub use agent::{Agent, classify};
pub use throttle::Throttle;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::error::Result;
use crate::shm::{LatencyRingBuffer, SharedCounterStore};

/// Root of every request counter key.
pub const REQUESTS_PREFIX: &str = "requests";
/// Total number of requests served.
pub const TOTAL_KEY: &str = "requests.total";

/// Latency windows reported in snapshots.
pub const LATENCY_WINDOWS: [usize; 3] = [100, 1_000, 10_000];

/// Counter key for a response status.
pub fn code_key(status: u16) -> String {
    format!("{}.codes.{}", REQUESTS_PREFIX, status)
}

/// Counter key for a browser on an OS.
pub fn browser_key(agent: &Agent) -> String {
    format!(
        "{}.os.{}.browser.{}",
        REQUESTS_PREFIX, agent.os, agent.browser
    )
}

/// One served request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSample {
    pub status: u16,
    pub agent: Option<Agent>,
    pub latency: Duration,
}

/// Record a request: counters under one lock acquisition, then the latency.
pub fn record_request(
    store: &SharedCounterStore,
    latency: &LatencyRingBuffer,
    sample: &RequestSample,
) -> Result<()> {
    {
        let mut guard = store.lock_write();
        guard.increment(TOTAL_KEY, 1)?;
        guard.increment(&code_key(sample.status), 1)?;
        if let Some(agent) = &sample.agent {
            guard.increment(&browser_key(agent), 1)?;
        }
    }
    let micros = u64::try_from(sample.latency.as_micros()).unwrap_or(u64::MAX);
    latency.push(micros);
    Ok(())
}

/// Average latency in microseconds over the latest samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub last_100: Option<f64>,
    pub last_1000: Option<f64>,
    pub last_10000: Option<f64>,
}

impl LatencySummary {
    pub fn capture(ring: &LatencyRingBuffer) -> Self {
        let [a, b, c] = LATENCY_WINDOWS.map(|window| ring.average(window));
        Self {
            last_100: a,
            last_1000: b,
            last_10000: c,
        }
    }
}

/// Point-in-time view of the pool's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Nested request counters: `{total, codes: {...}, os: {...}}`.
    pub requests: Value,
    pub latency: LatencySummary,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            requests: Value::Object(Map::new()),
            latency: LatencySummary::default(),
        }
    }
}

impl MetricsSnapshot {
    /// Read the shared regions.
    pub fn capture(store: &SharedCounterStore, ring: &LatencyRingBuffer) -> Self {
        let requests = match store.snapshot(REQUESTS_PREFIX) {
            Value::Object(mut root) => root
                .remove(REQUESTS_PREFIX)
                .unwrap_or_else(|| Value::Object(Map::new())),
            _ => Value::Object(Map::new()),
        };
        Self {
            requests,
            latency: LatencySummary::capture(ring),
        }
    }

    /// Total requests, 0 if none were recorded.
    pub fn total(&self) -> i64 {
        self.requests
            .get("total")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Responses recorded with `status`.
    pub fn code_count(&self, status: u16) -> i64 {
        self.requests
            .get("codes")
            .and_then(|codes| codes.get(status.to_string()))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }
}

/// Throttled snapshot publisher, hosted by the aggregator worker.
#[derive(Debug)]
pub struct MetricsAggregator {
    snapshots: watch::Receiver<Arc<MetricsSnapshot>>,
    throttle: Throttle,
}

impl MetricsAggregator {
    /// Publish an initial snapshot and start the throttle task.
    pub fn spawn(
        store: Arc<SharedCounterStore>,
        ring: Arc<LatencyRingBuffer>,
        interval: Duration,
    ) -> Self {
        let initial = Arc::new(MetricsSnapshot::capture(&store, &ring));
        let (tx, snapshots) = watch::channel(initial);
        let throttle = Throttle::spawn(interval, move || {
            let snapshot = MetricsSnapshot::capture(&store, &ring);
            tracing::trace!(total = snapshot.total(), "Recomputed metrics snapshot");
            tx.send_replace(Arc::new(snapshot));
        });
        Self {
            snapshots,
            throttle,
        }
    }

    /// Shared memory changed; recompute at the end of the interval.
    pub fn notify(&self) {
        self.throttle.trigger();
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Arc<MetricsSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MetricsSnapshot>> {
        self.snapshots.clone()
    }

    /// Number of recomputations since start.
    pub fn recomputations(&self) -> u64 {
        self.throttle.fired()
    }
}
