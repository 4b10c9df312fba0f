//! Lock-free latency ring buffer in shared memory.
//!
//! Writers claim a slot with a single `fetch_add` on a shared cursor and store
//! their sample there without any lock. Because each claim is unique, no two
//! pushes of the same cursor generation ever target the same slot. Readers
//! race with writers, so averages are best-effort.

use std::mem::size_of;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use super::SharedRegion;
use crate::error::{ClusterError, Result};

/// "TPLATN01"
const RING_MAGIC: u64 = u64::from_le_bytes(*b"TPLATN01");
const HEADER_SIZE: usize = 64;

#[repr(C)]
struct RingHeader {
    magic: AtomicU64,
    capacity: AtomicU64,
    /// Total number of claims ever made; slot = cursor % capacity.
    cursor: AtomicU64,
    _reserved: [AtomicU64; 5],
}

const _: () = assert!(size_of::<RingHeader>() == HEADER_SIZE);

/// Fixed-size ring of the most recent latency samples (microseconds).
pub struct LatencyRingBuffer {
    region: SharedRegion,
    header: NonNull<RingHeader>,
    slots: NonNull<AtomicU64>,
    capacity: usize,
}

// SAFETY: pointers target `region`, which lives as long as `self`; all access is atomic.
unsafe impl Send for LatencyRingBuffer {}
unsafe impl Sync for LatencyRingBuffer {}

impl LatencyRingBuffer {
    /// Region size needed for `capacity` samples.
    pub fn region_size(capacity: usize) -> usize {
        HEADER_SIZE + capacity * size_of::<AtomicU64>()
    }

    /// Create a new ring file holding `capacity` samples.
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ClusterError::Config(
                "latency buffer capacity must be at least 1".to_string(),
            ));
        }
        let region = SharedRegion::create(path, Self::region_size(capacity))?;
        let ring = Self::attach(region, capacity)?;
        ring.header().capacity.store(capacity as u64, Ordering::Relaxed);
        ring.header().magic.store(RING_MAGIC, Ordering::Release);
        Ok(ring)
    }

    /// Open a ring created by [`LatencyRingBuffer::create`].
    pub fn open(path: &Path) -> Result<Self> {
        let region = SharedRegion::open(path)?;
        // SAFETY: RingHeader is repr(C) atomics.
        let header: &RingHeader = unsafe { region.view(0)? };
        if header.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(ClusterError::InvalidRegion {
                path: path.to_path_buf(),
                reason: "not a latency ring".to_string(),
            });
        }
        let capacity = header.capacity.load(Ordering::Relaxed) as usize;
        Self::attach(region, capacity)
    }

    fn attach(region: SharedRegion, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ClusterError::InvalidRegion {
                path: region.path().to_path_buf(),
                reason: "zero capacity".to_string(),
            });
        }
        // SAFETY: repr(C) atomics, bounds checked by the region.
        let header = NonNull::from(unsafe { region.view::<RingHeader>(0)? });
        let slots = NonNull::from(unsafe { region.slice::<AtomicU64>(HEADER_SIZE, capacity)? }).cast();
        Ok(Self {
            region,
            header,
            slots,
            capacity,
        })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: validated in `attach`.
        unsafe { self.header.as_ref() }
    }

    fn slots(&self) -> &[AtomicU64] {
        // SAFETY: validated in `attach`.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.capacity) }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots holding a sample (saturates at capacity).
    pub fn len(&self) -> usize {
        (self.header().cursor.load(Ordering::Acquire) as usize).min(self.capacity)
    }

    /// Whether nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a sample and return the slot it was written to.
    pub fn push(&self, sample: u64) -> usize {
        let claim = self.header().cursor.fetch_add(1, Ordering::AcqRel);
        let slot = (claim % self.capacity as u64) as usize;
        self.slots()[slot].store(sample, Ordering::Release);
        slot
    }

    /// Up to `n` of the most recently claimed samples, newest first.
    pub fn recent(&self, n: usize) -> Vec<u64> {
        let cursor = self.header().cursor.load(Ordering::Acquire);
        let available = (cursor as usize).min(self.capacity).min(n);
        let slots = self.slots();
        (1..=available as u64)
            .map(|back| {
                let slot = ((cursor - back) % self.capacity as u64) as usize;
                slots[slot].load(Ordering::Acquire)
            })
            .collect()
    }

    /// Mean of the last `min(window, len)` samples, or `None` when empty.
    ///
    /// Concurrent pushes may land while this reads, so the result is
    /// eventually accurate rather than a consistent snapshot.
    pub fn average(&self, window: usize) -> Option<f64> {
        let samples = self.recent(window);
        if samples.is_empty() {
            return None;
        }
        let sum: u128 = samples.iter().map(|&s| u128::from(s)).sum();
        Some(sum as f64 / samples.len() as f64)
    }
}

impl std::fmt::Debug for LatencyRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyRingBuffer")
            .field("path", &self.region.path())
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
