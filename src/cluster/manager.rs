//! Worker pool manager.
//!
//! Owns the worker processes, the shared regions, and the public listener.
//! A supervisor task consumes [`WorkerEvent`]s: it registers workers with the
//! balancer once they report `listening`, routes their control messages, and
//! replaces crashed workers under the restart policy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::balancer::{LoadBalancer, WorkerSlot};
use super::proxy::{self, ProxyStats};
use super::readiness::ReadinessGate;
use super::restart::RestartTracker;
use crate::address::WorkerAddress;
use crate::config::{ClusterConfig, WorkerTransport};
use crate::error::{ClusterError, Result};
use crate::paths;
use crate::shm::{LatencyRingBuffer, SharedCounterStore};
use crate::worker::{
    ControlMessage, TerminationReason, WorkerBootstrap, WorkerEvent, WorkerHandle, WorkerId,
    WorkerLauncher, WorkerState,
};

/// Extra time given to each escalation step of `stop`.
const ESCALATION_GRACE: Duration = Duration::from_secs(1);

/// Pause after a failed accept (e.g. EMFILE) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Pool-wide counts, published on every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Worker processes running.
    pub alive: usize,
    /// Workers registered with the balancer.
    pub serving: usize,
    /// Replacements waiting out their backoff.
    pub pending_restarts: usize,
}

/// Snapshot of one worker, for status output.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub generation: u64,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub address: Option<WorkerAddress>,
    pub uptime: Duration,
}

struct Pool {
    config: ClusterConfig,
    launcher: WorkerLauncher,
    state_dir: TempDir,
    counters: Arc<SharedCounterStore>,
    latency: Arc<LatencyRingBuffer>,
    workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
    balancer: Arc<LoadBalancer>,
    gate: ReadinessGate,
    startup_failures: Mutex<HashMap<WorkerId, u32>>,
    restarts: Mutex<HashMap<WorkerId, RestartTracker>>,
    pending_restarts: AtomicUsize,
    next_generation: AtomicU64,
    stopping: AtomicBool,
    events: mpsc::UnboundedSender<WorkerEvent>,
    status: watch::Sender<PoolStatus>,
}

struct PublicListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// A running worker pool.
///
/// Dropping the manager kills every worker and removes the state directory.
pub struct ClusterManager {
    pool: Arc<Pool>,
    supervisor: JoinHandle<()>,
    listener: Option<PublicListener>,
}

impl ClusterManager {
    /// Create the shared regions, spawn `pool_size` workers, and wait until
    /// every one of them reports `listening`.
    ///
    /// Fails when a slot exhausts its startup retries, a worker exits
    /// gracefully before listening, or `startup_timeout` elapses. Every
    /// spawned worker is killed on failure.
    #[instrument(skip_all, fields(pool_size = config.pool_size))]
    pub async fn start(config: ClusterConfig, launcher: WorkerLauncher) -> Result<Self> {
        config.validate()?;

        let state_dir = create_state_dir(&config)?;
        let counters = Arc::new(SharedCounterStore::create(
            &paths::counters_path(state_dir.path()),
            config.counter_capacity,
        )?);
        let latency = Arc::new(LatencyRingBuffer::create(
            &paths::latency_path(state_dir.path()),
            config.latency_capacity,
        )?);
        info!(
            state_dir = %state_dir.path().display(),
            transport = %config.transport,
            "Starting worker pool"
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Pool {
            gate: ReadinessGate::new(config.pool_size),
            config,
            launcher,
            state_dir,
            counters,
            latency,
            workers: Mutex::new(HashMap::new()),
            balancer: Arc::new(LoadBalancer::new()),
            startup_failures: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
            pending_restarts: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            events,
            status: watch::Sender::new(PoolStatus::default()),
        });

        let supervisor = tokio::spawn(supervise(pool.clone(), events_rx));
        let manager = Self {
            pool,
            supervisor,
            listener: None,
        };

        for id in 0..manager.pool.config.pool_size {
            manager.pool.spawn_worker(WorkerId(id));
        }
        manager.pool.publish_status();

        manager
            .pool
            .gate
            .wait(manager.pool.config.startup_timeout)
            .await?;
        info!(workers = manager.pool.config.pool_size, "All workers listening");
        Ok(manager)
    }

    /// Open the public listener and start accepting connections.
    pub async fn listen<A: ToSocketAddrs>(&mut self, addr: A) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        if let Some(previous) = self.listener.take() {
            previous.task.abort();
        }
        let task = tokio::spawn(accept_loop(listener, self.pool.balancer.clone()));
        info!(%local_addr, "Accepting connections");
        self.listener = Some(PublicListener { local_addr, task });
        Ok(local_addr)
    }

    /// Route one inbound connection to a worker and proxy it to completion.
    pub async fn handle_connection<I>(&self, inbound: I) -> Result<ProxyStats>
    where
        I: AsyncRead + AsyncWrite + Unpin,
    {
        route_connection(&self.pool.balancer, inbound).await
    }

    /// Address of the public listener, once `listen` has been called.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    pub fn status(&self) -> watch::Receiver<PoolStatus> {
        self.pool.status.subscribe()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.pool.config
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.pool.balancer
    }

    pub fn counters(&self) -> &SharedCounterStore {
        &self.pool.counters
    }

    pub fn latency(&self) -> &LatencyRingBuffer {
        &self.pool.latency
    }

    /// Private directory holding the shared regions and worker sockets.
    pub fn state_dir(&self) -> &Path {
        self.pool.state_dir.path()
    }

    /// Running workers, ordered by id.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<_> = self
            .pool
            .workers()
            .values()
            .map(|h| WorkerInfo {
                id: h.id(),
                generation: h.generation(),
                pid: h.pid(),
                state: h.state(),
                address: h.address().cloned(),
                uptime: h.started_at.elapsed(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Resolves once no worker is running and none is waiting to restart.
    pub async fn closed(&self) -> ClusterError {
        let mut status = self.pool.status.subscribe();
        let _ = status
            .wait_for(|s| s.alive == 0 && s.pending_restarts == 0)
            .await;
        ClusterError::NoLiveWorkers
    }

    /// Shut the pool down.
    ///
    /// Sends `shutdown` to every worker and waits up to `shutdown_timeout`;
    /// stragglers get SIGTERM, then SIGKILL. The public listener closes last.
    #[instrument(skip_all)]
    pub async fn stop(mut self) -> Result<()> {
        self.pool.stopping.store(true, Ordering::SeqCst);

        let count = {
            let mut workers = self.pool.workers();
            for handle in workers.values_mut() {
                handle.state = WorkerState::Stopping;
                handle.send(ControlMessage::Shutdown);
            }
            workers.len()
        };
        info!(workers = count, "Stopping worker pool");

        let mut status = self.pool.status.subscribe();
        let all_exited = |s: &PoolStatus| s.alive == 0;
        if tokio::time::timeout(self.pool.config.shutdown_timeout, status.wait_for(all_exited))
            .await
            .is_err()
        {
            let stragglers = {
                let workers = self.pool.workers();
                workers.values().filter(|h| h.terminate()).count()
            };
            warn!(stragglers, "Workers did not exit in time; sent SIGTERM");

            if tokio::time::timeout(ESCALATION_GRACE, status.wait_for(all_exited))
                .await
                .is_err()
            {
                warn!("Killing remaining workers");
                for handle in self.pool.workers().values_mut() {
                    handle.kill();
                }
                let _ = tokio::time::timeout(ESCALATION_GRACE, status.wait_for(all_exited)).await;
            }
        }

        if let Some(listener) = self.listener.take() {
            listener.task.abort();
            let _ = listener.task.await;
        }
        info!("Worker pool stopped");
        Ok(())
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.pool.stopping.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
        }
        self.supervisor.abort();
        // Dropped handles kill their processes.
        let handles: Vec<WorkerHandle> = self.pool.workers().drain().map(|(_, h)| h).collect();
        drop(handles);
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("state_dir", &self.state_dir())
            .field("status", &*self.pool.status.borrow())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn create_state_dir(config: &ClusterConfig) -> Result<TempDir> {
    let base = config
        .state_dir
        .clone()
        .unwrap_or_else(paths::state_base_dir);
    std::fs::create_dir_all(&base)?;
    Ok(tempfile::Builder::new()
        .prefix(paths::STATE_DIR_PREFIX)
        .tempdir_in(&base)?)
}

/// Pick a worker for `inbound` and splice them together.
pub async fn route_connection<I>(balancer: &LoadBalancer, inbound: I) -> Result<ProxyStats>
where
    I: AsyncRead + AsyncWrite + Unpin,
{
    let Some(lease) = balancer.acquire() else {
        warn!("No live worker; dropping connection");
        return Err(ClusterError::NoLiveWorkers);
    };
    let target = lease.slot().address().clone();
    proxy::proxy_connection(inbound, &target).await
}

async fn accept_loop(listener: TcpListener, balancer: Arc<LoadBalancer>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let balancer = balancer.clone();
                tokio::spawn(async move {
                    if let Err(e) = route_connection(&balancer, stream).await {
                        debug!(%peer, error = %e, "Connection closed with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn supervise(pool: Arc<Pool>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message {
                id,
                generation,
                message,
            } => pool.on_message(id, generation, message),
            WorkerEvent::Exited {
                id,
                generation,
                reason,
            } => pool.on_worker_exit(id, generation, reason),
        }
    }
}

impl Pool {
    fn workers(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_status(&self) {
        let next = PoolStatus {
            alive: self.workers().len(),
            serving: self.balancer.len(),
            pending_restarts: self.pending_restarts.load(Ordering::SeqCst),
        };
        self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }

    fn worker_address(&self, id: WorkerId, generation: u64) -> WorkerAddress {
        match self.config.transport {
            WorkerTransport::Unix => WorkerAddress::Unix {
                path: paths::worker_socket_path(self.state_dir.path(), id, generation),
            },
            WorkerTransport::Tcp => WorkerAddress::loopback(),
        }
    }

    /// Start a worker for slot `id`. Callers publish the status afterwards.
    fn spawn_worker(self: &Arc<Self>, id: WorkerId) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let bootstrap = WorkerBootstrap {
            worker_id: id,
            generation,
            pool_size: self.config.pool_size,
            address: self.worker_address(id, generation),
            counters: self.counters.path().to_path_buf(),
            latency: self.latency.path().to_path_buf(),
            aggregator_id: self.config.aggregator,
            aggregate_interval_ms: self.config.aggregate_interval.as_millis() as u64,
            notify_interval_ms: self.config.notify_interval.as_millis() as u64,
        };

        let spawned = self.launcher.spawn(&bootstrap).and_then(|child| {
            WorkerHandle::attach(id, generation, child, self.events.clone())
        });
        match spawned {
            Ok(handle) => {
                info!(worker_id = %id, generation, pid = ?handle.pid(), "Spawned worker");
                self.workers().insert(id, handle);
            }
            Err(e) => {
                warn!(worker_id = %id, generation, error = %e, "Failed to spawn worker");
                self.retire(id, generation, TerminationReason::SpawnFailed(e.to_string()));
            }
        }
    }

    fn is_current(&self, id: WorkerId, generation: u64) -> bool {
        self.workers()
            .get(&id)
            .is_some_and(|h| h.generation == generation)
    }

    fn on_message(&self, id: WorkerId, generation: u64, message: ControlMessage) {
        if !self.is_current(id, generation) {
            debug!(worker_id = %id, generation, kind = message.kind(), "Dropping message from replaced worker");
            return;
        }
        match message {
            ControlMessage::Listening { address } => self.on_listening(id, generation, address),
            ControlMessage::Broadcast {
                action,
                payload,
                target_worker_id,
                ..
            } => {
                let stamped = ControlMessage::Broadcast {
                    action,
                    payload,
                    target_worker_id,
                    owner_worker_id: Some(id),
                };
                let workers = self.workers();
                match target_worker_id {
                    Some(target) => match workers.get(&target) {
                        Some(handle) => {
                            handle.send(stamped);
                        }
                        None => debug!(worker_id = %id, target = %target, "Broadcast target is not running"),
                    },
                    None => {
                        for handle in workers.values().filter(|h| h.id != id) {
                            handle.send(stamped.clone());
                        }
                    }
                }
            }
            ControlMessage::Response {
                owner_worker_id,
                payload,
            } => match self.workers().get(&owner_worker_id) {
                Some(handle) => {
                    handle.send(ControlMessage::response(owner_worker_id, payload));
                }
                None => debug!(worker_id = %id, owner = %owner_worker_id, "Response owner is not running"),
            },
            ControlMessage::Shutdown => {
                warn!(worker_id = %id, "Worker sent a manager-only message");
            }
        }
    }

    fn on_listening(&self, id: WorkerId, generation: u64, address: WorkerAddress) {
        let registered = {
            let mut workers = self.workers();
            match workers.get_mut(&id) {
                Some(handle) if handle.state == WorkerState::Spawning => {
                    handle.address = Some(address.clone());
                    handle.state = WorkerState::Serving;
                    true
                }
                _ => false,
            }
        };
        if !registered {
            warn!(worker_id = %id, generation, "Ignoring repeated listening report");
            return;
        }

        self.balancer
            .insert(Arc::new(WorkerSlot::new(id, address.clone())));
        info!(worker_id = %id, generation, %address, "Worker listening");
        self.gate.mark_ready(id);
        self.publish_status();
    }

    fn on_worker_exit(self: &Arc<Self>, id: WorkerId, generation: u64, reason: TerminationReason) {
        self.retire(id, generation, reason);
        self.publish_status();
    }

    /// Forget an exited worker and decide whether its slot is refilled.
    fn retire(self: &Arc<Self>, id: WorkerId, generation: u64, reason: TerminationReason) {
        let removed = {
            let mut workers = self.workers();
            match workers.get(&id) {
                Some(handle) if handle.generation == generation => workers.remove(&id),
                _ => None,
            }
        };
        let spawn_failed = matches!(reason, TerminationReason::SpawnFailed(_));
        if removed.is_none() && !spawn_failed {
            debug!(worker_id = %id, generation, "Ignoring exit of a replaced worker");
            return;
        }
        if removed.is_some() {
            self.balancer.remove(id);
            self.gate.unmark(id);
        }
        let pid = removed.as_ref().and_then(|h| h.pid());

        if self.stopping.load(Ordering::SeqCst) {
            debug!(worker_id = %id, generation, ?pid, %reason, "Worker exited during shutdown");
            return;
        }

        if reason.is_graceful() {
            info!(worker_id = %id, generation, ?pid, %reason, "Worker exited gracefully; not respawning");
            if !self.gate.is_open() {
                let attempts = self.record_startup_failure(id);
                self.gate
                    .fail(id, attempts, format!("{} before listening", reason));
            }
            return;
        }

        warn!(worker_id = %id, generation, ?pid, %reason, "Worker exited abnormally");

        if !self.gate.is_open() {
            let attempts = self.record_startup_failure(id);
            if attempts > self.config.startup_retries {
                error!(worker_id = %id, attempts, "Worker failed to start; giving up");
                self.gate.fail(id, attempts, reason.to_string());
            } else {
                self.schedule_respawn(id, self.config.restart.backoff(attempts - 1));
            }
            return;
        }

        let delay = self
            .restarts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .next_delay(&self.config.restart, Instant::now());
        match delay {
            Some(delay) => {
                info!(worker_id = %id, delay_ms = delay.as_millis() as u64, "Respawning worker");
                self.schedule_respawn(id, delay);
            }
            None => {
                error!(
                    worker_id = %id,
                    max_restarts = self.config.restart.max_restarts,
                    window_secs = self.config.restart.window.as_secs(),
                    "Restart budget exhausted; slot abandoned"
                );
            }
        }
    }

    fn record_startup_failure(&self, id: WorkerId) -> u32 {
        let mut failures = self
            .startup_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let attempts = failures.entry(id).or_insert(0);
        *attempts += 1;
        *attempts
    }

    fn schedule_respawn(self: &Arc<Self>, id: WorkerId, delay: Duration) {
        self.pending_restarts.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.spawn_worker(id);
            pool.pending_restarts.fetch_sub(1, Ordering::SeqCst);
            pool.publish_status();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::RestartPolicy;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Speaks just enough protocol to be routable, then logs what it receives.
    const FAKE_WORKER: &str = r#"
ID=$(printf '%s' "$TIDEPOOL_WORKER_BOOTSTRAP" | sed 's/.*"worker_id":\([0-9]*\).*/\1/')
echo "{\"type\":\"listening\",\"address\":{\"kind\":\"tcp\",\"addr\":\"$TARGET\"}}"
echo '{"type":"broadcast","action":"metrics.updated"}'
if [ "$ID" = 0 ]; then
  echo '{"type":"response","owner_worker_id":1,"payload":{"answer":42}}'
fi
exec cat > "$LOG_DIR/w$ID.log"
"#;

    fn config(dir: &Path, pool_size: usize) -> ClusterConfig {
        ClusterConfig {
            pool_size,
            state_dir: Some(dir.to_path_buf()),
            counter_capacity: 64,
            latency_capacity: 64,
            startup_retries: 2,
            startup_timeout: Duration::from_secs(10),
            restart: RestartPolicy {
                max_restarts: 2,
                window: Duration::from_secs(60),
                base_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
            shutdown_timeout: Duration::from_millis(300),
            ..ClusterConfig::default()
        }
    }

    fn fake_launcher(log_dir: &Path, target: &str) -> WorkerLauncher {
        WorkerLauncher::new("sh")
            .arg("-c")
            .arg(FAKE_WORKER)
            .env("LOG_DIR", log_dir)
            .env("TARGET", target)
    }

    fn script(body: &str) -> WorkerLauncher {
        WorkerLauncher::new("sh").arg("-c").arg(body.to_string())
    }

    async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn read_log(dir: &Path, id: usize) -> String {
        std::fs::read_to_string(dir.join(format!("w{}.log", id))).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_routes_broadcasts_and_responses() {
        let dir = tempdir().unwrap();
        let manager = ClusterManager::start(
            config(dir.path(), 2),
            fake_launcher(dir.path(), "127.0.0.1:9"),
        )
        .await
        .unwrap();

        let status = *manager.status().borrow();
        assert_eq!(status.alive, 2);
        assert_eq!(status.serving, 2);
        assert!(manager.state_dir().join("counters.shm").exists());

        eventually("stamped broadcasts", || {
            read_log(dir.path(), 0).contains(r#""owner_worker_id":1"#)
                && read_log(dir.path(), 1).contains(r#""owner_worker_id":0"#)
                && read_log(dir.path(), 1).contains(r#""answer":42"#)
        })
        .await;

        // A broadcast without a target never goes back to its sender.
        assert!(!read_log(dir.path(), 0).contains(r#""owner_worker_id":0"#));

        // `cat` ignores the shutdown message, so stop has to escalate.
        let state_dir = manager.state_dir().to_path_buf();
        manager.stop().await.unwrap();
        assert!(read_log(dir.path(), 0).contains(r#"{"type":"shutdown"}"#));
        eventually("state dir removal", || !state_dir.exists()).await;
    }

    #[tokio::test]
    async fn test_connections_are_proxied_to_workers() {
        let dir = tempdir().unwrap();
        let worker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = worker.local_addr().unwrap().to_string();
        let mut manager = ClusterManager::start(
            config(dir.path(), 1),
            fake_launcher(dir.path(), &target),
        )
        .await
        .unwrap();
        let public = manager.listen("127.0.0.1:0").await.unwrap();
        assert_eq!(manager.local_addr(), Some(public));

        let mut client = TcpStream::connect(public).await.unwrap();
        client.write_all(b"hi").await.unwrap();

        let (mut upstream, _) = worker.accept().await.unwrap();
        let mut buf = [0u8; 2];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(manager.balancer().loads(), vec![(WorkerId(0), 1)]);

        upstream.write_all(b"yo").await.unwrap();
        drop(upstream);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"yo");

        eventually("load to drain", || {
            manager.balancer().loads() == vec![(WorkerId(0), 0)]
        })
        .await;
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_live_worker_drops_connection() {
        let balancer = LoadBalancer::with_seed(1);
        let (_client, server) = tokio::io::duplex(64);
        let err = route_connection(&balancer, server).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoLiveWorkers));
    }

    #[tokio::test]
    async fn test_crashing_worker_fails_startup_after_retries() {
        let dir = tempdir().unwrap();
        let err = ClusterManager::start(config(dir.path(), 1), script("exit 7"))
            .await
            .unwrap_err();
        match err {
            ClusterError::StartupFailed {
                id,
                attempts,
                reason,
            } => {
                assert_eq!(id, WorkerId(0));
                assert_eq!(attempts, 3);
                assert!(reason.contains("code 7"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_graceful_exit_before_listening_fails_startup() {
        let dir = tempdir().unwrap();
        let err = ClusterManager::start(config(dir.path(), 2), script("exit 0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::StartupFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_program_fails_startup() {
        let dir = tempdir().unwrap();
        let launcher = WorkerLauncher::new(dir.path().join("no-such-worker"));
        let err = ClusterManager::start(config(dir.path(), 1), launcher)
            .await
            .unwrap_err();
        match err {
            ClusterError::StartupFailed { reason, .. } => {
                assert!(reason.contains("failed to spawn"), "{reason}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_worker_lost_before_gate_opens_is_awaited() {
        let dir = tempdir().unwrap();
        // Slot 0 reports once and dies; slot 1 reports late.
        let launcher = script(
            r#"
ID=$(printf '%s' "$TIDEPOOL_WORKER_BOOTSTRAP" | sed 's/.*"worker_id":\([0-9]*\).*/\1/')
LISTENING='{"type":"listening","address":{"kind":"tcp","addr":"127.0.0.1:9"}}'
if [ "$ID" = 0 ] && [ ! -e "$LOG_DIR/crashed" ]; then
  : > "$LOG_DIR/crashed"
  echo "$LISTENING"
  sleep 0.05
  exit 7
fi
if [ "$ID" = 1 ]; then
  sleep 0.3
fi
echo "$LISTENING"
exec sleep 30
"#,
        )
        .env("LOG_DIR", dir.path());
        let cfg = ClusterConfig {
            restart: RestartPolicy {
                base_backoff: Duration::from_millis(800),
                max_backoff: Duration::from_millis(800),
                ..config(dir.path(), 2).restart
            },
            ..config(dir.path(), 2)
        };

        let manager = ClusterManager::start(cfg, launcher).await.unwrap();
        assert!(dir.path().join("crashed").exists());

        let status = *manager.status().borrow();
        assert_eq!(status.alive, 2);
        assert_eq!(status.serving, 2);
        assert!(
            manager
                .workers()
                .iter()
                .all(|w| w.state == WorkerState::Serving)
        );

        // The crash was charged to the startup allowance, not the runtime budget.
        let pool = &manager.pool;
        assert_eq!(
            pool.startup_failures.lock().unwrap().get(&WorkerId(0)),
            Some(&1)
        );
        assert!(pool.restarts.lock().unwrap().get(&WorkerId(0)).is_none());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let dir = tempdir().unwrap();
        let cfg = ClusterConfig {
            startup_timeout: Duration::from_millis(300),
            ..config(dir.path(), 2)
        };
        let err = ClusterManager::start(cfg, script("exec sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::ReadinessTimeout {
                ready: 0,
                expected: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_killed_worker_is_replaced_in_its_slot() {
        let dir = tempdir().unwrap();
        let manager = ClusterManager::start(
            config(dir.path(), 2),
            fake_launcher(dir.path(), "127.0.0.1:9"),
        )
        .await
        .unwrap();

        let before = manager.workers();
        let victim = before[1].clone();
        kill(
            Pid::from_raw(victim.pid.unwrap() as i32),
            Signal::SIGKILL,
        )
        .unwrap();

        eventually("replacement", || {
            let workers = manager.workers();
            workers.len() == 2
                && workers[1].generation > victim.generation
                && workers[1].state == WorkerState::Serving
        })
        .await;

        let after = manager.workers();
        assert_eq!(after[1].id, WorkerId(1));
        assert_ne!(after[1].pid, victim.pid);
        assert_eq!(after[0].pid, before[0].pid);
        assert_eq!(manager.status().borrow().serving, 2);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_exit_is_not_respawned() {
        let dir = tempdir().unwrap();
        let launcher = script(
            r#"echo '{"type":"listening","address":{"kind":"tcp","addr":"127.0.0.1:9"}}'; sleep 1; exit 0"#,
        );
        let manager = ClusterManager::start(config(dir.path(), 1), launcher)
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(10), manager.closed())
            .await
            .expect("pool never closed");
        assert!(matches!(err, ClusterError::NoLiveWorkers));
        assert!(manager.workers().is_empty());
        assert!(manager.balancer().is_empty());

        // Nothing comes back.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.status().borrow().alive, 0);
    }

    #[tokio::test]
    async fn test_restart_budget_abandons_slot() {
        let dir = tempdir().unwrap();
        let launcher = script(
            r#"echo '{"type":"listening","address":{"kind":"tcp","addr":"127.0.0.1:9"}}'; sleep 0.3; exit 9"#,
        );
        let manager = ClusterManager::start(config(dir.path(), 1), launcher)
            .await
            .unwrap();

        // One original plus `max_restarts` replacements, then the slot stays empty.
        tokio::time::timeout(Duration::from_secs(15), manager.closed())
            .await
            .expect("slot was never abandoned");
        assert!(manager.workers().is_empty());
        assert_eq!(
            manager
                .pool
                .restarts
                .lock()
                .unwrap()
                .get(&WorkerId(0))
                .map(RestartTracker::recent),
            Some(2)
        );
    }
}
