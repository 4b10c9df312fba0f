//! Worker-side runtime.
//!
//! Runs when `tidepool worker` is invoked by the manager. It opens the shared
//! regions named in the bootstrap, binds the private listener, reports
//! `listening`, then serves connections with the application until told to
//! stop. On shutdown the listener is closed first and in-flight connections
//! are given time to finish.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::WorkerId;
use super::app::Application;
use super::ipc::{LineReader, LineWriter, forward_outbox};
use super::protocol::{Action, ControlMessage};
use super::signals::EXIT_SHUTDOWN;
use super::spawn::WorkerBootstrap;
use crate::error::{ClusterError, Result};
use crate::metrics::{self, MetricsAggregator, MetricsSnapshot, RequestSample, Throttle};
use crate::shm::{LatencyRingBuffer, SharedCounterStore};

/// How long in-flight connections may run after shutdown begins.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for worker-to-worker requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `shutdown` message or SIGTERM.
    Shutdown,
    /// The manager closed the control channel.
    Orphaned,
}

impl WorkerExit {
    /// Process exit code. Both cases are deliberate, so neither is respawned.
    pub fn code(self) -> i32 {
        EXIT_SHUTDOWN
    }
}

/// What the application sees of its worker.
pub struct WorkerContext {
    bootstrap: WorkerBootstrap,
    store: Arc<SharedCounterStore>,
    latency: Arc<LatencyRingBuffer>,
    outbox: mpsc::UnboundedSender<ControlMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_request: AtomicU64,
    aggregator: Option<MetricsAggregator>,
    notifier: Option<Throttle>,
}

impl WorkerContext {
    /// Build the context. Starts the aggregator or the notification throttle,
    /// so it must be called inside a tokio runtime.
    pub(crate) fn new(
        bootstrap: WorkerBootstrap,
        store: Arc<SharedCounterStore>,
        latency: Arc<LatencyRingBuffer>,
        outbox: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        let (aggregator, notifier) = if bootstrap.is_aggregator() {
            let aggregator = MetricsAggregator::spawn(
                store.clone(),
                latency.clone(),
                bootstrap.aggregate_interval(),
            );
            (Some(aggregator), None)
        } else {
            let outbox = outbox.clone();
            let target = bootstrap.aggregator_id;
            let notifier = Throttle::spawn(bootstrap.notify_interval(), move || {
                let _ = outbox.send(ControlMessage::broadcast(
                    Action::MetricsUpdated,
                    Value::Null,
                    Some(target),
                ));
            });
            (None, Some(notifier))
        };

        Self {
            bootstrap,
            store,
            latency,
            outbox,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            aggregator,
            notifier,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.bootstrap.worker_id
    }

    pub fn generation(&self) -> u64 {
        self.bootstrap.generation
    }

    pub fn pool_size(&self) -> usize {
        self.bootstrap.pool_size
    }

    pub fn is_aggregator(&self) -> bool {
        self.aggregator.is_some()
    }

    pub fn counters(&self) -> &SharedCounterStore {
        &self.store
    }

    pub fn latency(&self) -> &LatencyRingBuffer {
        &self.latency
    }

    /// Record a served request and schedule a metrics notification.
    pub fn record_request(&self, sample: &RequestSample) -> Result<()> {
        metrics::record_request(&self.store, &self.latency, sample)?;
        self.metrics_updated();
        Ok(())
    }

    /// Shared counters changed.
    pub fn metrics_updated(&self) {
        if let Some(aggregator) = &self.aggregator {
            aggregator.notify();
        } else if let Some(notifier) = &self.notifier {
            notifier.trigger();
        }
    }

    /// Latest pool-wide snapshot.
    ///
    /// Non-aggregators ask the aggregator and fall back to reading shared
    /// memory themselves if it does not answer.
    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        if let Some(aggregator) = &self.aggregator {
            return aggregator.latest().as_ref().clone();
        }
        let target = self.bootstrap.aggregator_id;
        let answer = self
            .request(target, Action::MetricsQuery, Value::Null, REQUEST_TIMEOUT)
            .await
            .and_then(|body| Ok(serde_json::from_value::<MetricsSnapshot>(body)?));
        match answer {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(error = %e, "Aggregator did not answer; reading shared memory");
                MetricsSnapshot::capture(&self.store, &self.latency)
            }
        }
    }

    /// Send a broadcast to every other worker, or only to `target`.
    pub fn broadcast(&self, action: Action, payload: Value, target: Option<WorkerId>) -> Result<()> {
        self.outbox
            .send(ControlMessage::broadcast(action, payload, target))
            .map_err(|_| ClusterError::Worker("control channel closed".to_string()))
    }

    /// Send a targeted broadcast and wait for the matching `response`.
    pub async fn request(
        &self,
        target: WorkerId,
        action: Action,
        body: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, tx);

        let payload = json!({ "request_id": request_id, "body": body });
        if let Err(e) = self.broadcast(action, payload, Some(target)) {
            self.pending().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            _ => {
                self.pending().remove(&request_id);
                Err(ClusterError::RequestTimeout { target })
            }
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Act on a message routed from the manager (anything but `shutdown`).
    pub(crate) fn handle_control(&self, message: ControlMessage) {
        match message {
            ControlMessage::Broadcast {
                action: Action::MetricsUpdated,
                ..
            } => {
                if let Some(aggregator) = &self.aggregator {
                    aggregator.notify();
                }
            }
            ControlMessage::Broadcast {
                action: Action::MetricsQuery,
                payload,
                owner_worker_id,
                ..
            } => self.answer_metrics_query(payload, owner_worker_id),
            ControlMessage::Response { payload, .. } => self.complete(payload),
            other => warn!(kind = other.kind(), "Unexpected control message"),
        }
    }

    fn answer_metrics_query(&self, payload: Value, owner: Option<WorkerId>) {
        let (Some(aggregator), Some(owner)) = (&self.aggregator, owner) else {
            debug!(?owner, "Ignoring metrics query");
            return;
        };
        let body = match serde_json::to_value(aggregator.latest().as_ref()) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize metrics snapshot");
                return;
            }
        };
        let request_id = payload.get("request_id").cloned().unwrap_or(Value::Null);
        let reply = json!({ "request_id": request_id, "body": body });
        let _ = self.outbox.send(ControlMessage::response(owner, reply));
    }

    fn complete(&self, payload: Value) {
        let Value::Object(mut fields) = payload else {
            return;
        };
        let Some(request_id) = fields.get("request_id").and_then(Value::as_u64) else {
            return;
        };
        match self.pending().remove(&request_id) {
            Some(waiter) => {
                let _ = waiter.send(fields.remove("body").unwrap_or(Value::Null));
            }
            None => debug!(request_id, "Response for an expired request"),
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("id", &self.id())
            .field("generation", &self.generation())
            .field("aggregator", &self.is_aggregator())
            .finish()
    }
}

/// Worker process entry point: control channel on stdio, stop on SIGTERM
/// or SIGINT.
pub async fn run_worker<A: Application>(bootstrap: WorkerBootstrap, app: A) -> Result<WorkerExit> {
    // Installed before `listening` is sent, so neither the manager's SIGTERM
    // nor a terminal Ctrl-C sent to the process group is fatal to a ready
    // worker.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let terminated = async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    };
    run_worker_with_io(
        bootstrap,
        app,
        tokio::io::stdin(),
        tokio::io::stdout(),
        terminated,
    )
    .await
}

/// Run a worker over an arbitrary control channel until shutdown.
#[instrument(skip_all, fields(worker_id = %bootstrap.worker_id, generation = bootstrap.generation))]
pub async fn run_worker_with_io<A, R, W, S>(
    bootstrap: WorkerBootstrap,
    app: A,
    input: R,
    output: W,
    terminated: S,
) -> Result<WorkerExit>
where
    A: Application,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let store = Arc::new(SharedCounterStore::open(&bootstrap.counters)?);
    let latency = Arc::new(LatencyRingBuffer::open(&bootstrap.latency)?);

    let (listener, address) =
        bootstrap
            .address
            .bind()
            .await
            .map_err(|source| ClusterError::Bind {
                address: bootstrap.address.to_string(),
                source,
            })?;

    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(forward_outbox(LineWriter::new(output), outbox_rx));

    let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        let mut reader = LineReader::new(input);
        loop {
            match reader.recv().await {
                Ok(Some(message)) => {
                    if inbox_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(ClusterError::Json(e)) => {
                    warn!(error = %e, "Ignoring malformed control message")
                }
                Err(e) => {
                    warn!(error = %e, "Control channel read failed");
                    break;
                }
            }
        }
    });

    let ctx = Arc::new(WorkerContext::new(bootstrap, store, latency, outbox.clone()));
    let _ = outbox.send(ControlMessage::Listening {
        address: address.clone(),
    });
    info!(%address, aggregator = ctx.is_aggregator(), "Worker listening");

    let app = Arc::new(app);
    let mut connections = JoinSet::new();
    tokio::pin!(terminated);

    let exit = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    let app = app.clone();
                    let ctx = ctx.clone();
                    connections.spawn(async move {
                        if let Err(e) = app.handle(conn, ctx).await {
                            debug!(error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            message = inbox.recv() => match message {
                Some(ControlMessage::Shutdown) => {
                    info!("Shutdown requested");
                    break WorkerExit::Shutdown;
                }
                Some(message) => ctx.handle_control(message),
                None => {
                    warn!("Control channel closed; exiting");
                    break WorkerExit::Orphaned;
                }
            },
            _ = &mut terminated => {
                info!("Received SIGTERM");
                break WorkerExit::Shutdown;
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    // Stop accepting before draining.
    drop(listener);
    let in_flight = connections.len();
    if in_flight > 0 {
        debug!(in_flight, "Draining connections");
    }
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "Abandoning in-flight connections");
        connections.shutdown().await;
    }

    reader.abort();
    drop(ctx);
    drop(outbox);
    let _ = tokio::time::timeout(Duration::from_millis(200), writer).await;
    info!(?exit, "Worker stopped");
    Ok(exit)
}
