//! Power-of-two-choices load balancing.
//!
//! Two distinct live workers are sampled uniformly at random and the one with
//! fewer open connections wins. Loads are read without coordination, so a
//! pick may act on a slightly stale view.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::address::WorkerAddress;
use crate::worker::WorkerId;

/// A routable worker and its open-connection count.
#[derive(Debug)]
pub struct WorkerSlot {
    id: WorkerId,
    address: WorkerAddress,
    load: AtomicUsize,
}

impl WorkerSlot {
    pub fn new(id: WorkerId, address: WorkerAddress) -> Self {
        Self {
            id,
            address,
            load: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    /// Connections currently routed to this worker.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }
}

/// One routed connection; the slot's load drops when this is dropped.
#[derive(Debug)]
pub struct LoadLease {
    slot: Arc<WorkerSlot>,
}

impl LoadLease {
    fn new(slot: Arc<WorkerSlot>) -> Self {
        slot.load.fetch_add(1, Ordering::Relaxed);
        Self { slot }
    }

    pub fn slot(&self) -> &Arc<WorkerSlot> {
        &self.slot
    }
}

impl Drop for LoadLease {
    fn drop(&mut self) {
        self.slot.load.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The live worker set.
#[derive(Debug)]
pub struct LoadBalancer {
    slots: RwLock<Vec<Arc<WorkerSlot>>>,
    rng: Mutex<StdRng>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic picks, for tests and benchmarks.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Make a worker routable, replacing any slot with the same id.
    pub fn insert(&self, slot: Arc<WorkerSlot>) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|s| s.id != slot.id);
        slots.push(slot);
    }

    /// Stop routing to a worker. Open leases keep their slot alive.
    pub fn remove(&self, id: WorkerId) -> Option<Arc<WorkerSlot>> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let pos = slots.iter().position(|s| s.id == id)?;
        Some(slots.swap_remove(pos))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// `(id, load)` of every live worker, ordered by id.
    pub fn loads(&self) -> Vec<(WorkerId, usize)> {
        let mut loads: Vec<_> = self.read().iter().map(|s| (s.id, s.load())).collect();
        loads.sort_unstable();
        loads
    }

    /// Choose a worker without touching its load.
    pub fn pick(&self) -> Option<Arc<WorkerSlot>> {
        let slots = self.read();
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        pick_two(&slots, &mut *rng).cloned()
    }

    /// Choose a worker and count a connection against it.
    pub fn acquire(&self) -> Option<LoadLease> {
        self.pick().map(LoadLease::new)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<WorkerSlot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// P2C over `slots`: fewer than two → the only one (or none); otherwise the
/// less loaded of two distinct random slots, ties to the first sampled.
pub fn pick_two<'a, R: Rng + ?Sized>(
    slots: &'a [Arc<WorkerSlot>],
    rng: &mut R,
) -> Option<&'a Arc<WorkerSlot>> {
    match slots.len() {
        0 => None,
        1 => slots.first(),
        len => {
            let pair = index::sample(rng, len, 2);
            let (a, b) = (&slots[pair.index(0)], &slots[pair.index(1)]);
            if b.load() < a.load() { Some(b) } else { Some(a) }
        }
    }
}
