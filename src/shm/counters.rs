//! Shared counter store.
//!
//! A fixed-capacity open-addressing hash table of dotted string keys to i64
//! counters, placed in a [`SharedRegion`]. Every mutation happens under the
//! store's single [`WriteLock`]; lookups and snapshots are lock-free because
//! an entry's tag is published with release ordering only after its key bytes
//! are written, and keys are never removed or rewritten.

use std::mem::size_of;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use serde_json::{Map, Value};

use super::SharedRegion;
use super::lock::{WriteGuard, WriteLock};
use crate::error::{ClusterError, Result};

/// "TPCNTR01"
const STORE_MAGIC: u64 = u64::from_le_bytes(*b"TPCNTR01");
const HEADER_SIZE: usize = 64;
const KEY_WORDS: usize = 13;

/// Longest key the store accepts, in bytes.
pub const KEY_MAX_BYTES: usize = KEY_WORDS * size_of::<u64>();

#[repr(C)]
struct StoreHeader {
    magic: AtomicU64,
    capacity: AtomicU64,
    len: AtomicU64,
    lock: WriteLock,
    _pad: AtomicU32,
    _reserved: [AtomicU64; 4],
}

#[repr(C)]
struct Entry {
    /// 0 = vacant, otherwise the key hash with the low bit forced on.
    tag: AtomicU64,
    value: AtomicI64,
    key_len: AtomicU64,
    key: [AtomicU64; KEY_WORDS],
}

const _: () = assert!(size_of::<StoreHeader>() <= HEADER_SIZE);
const _: () = assert!(size_of::<Entry>() == 128);

impl Entry {
    fn key_matches(&self, key: &[u8]) -> bool {
        self.key_len.load(Ordering::Relaxed) as usize == key.len() && self.key_bytes() == key
    }

    fn key_bytes(&self) -> Vec<u8> {
        let len = (self.key_len.load(Ordering::Relaxed) as usize).min(KEY_MAX_BYTES);
        let mut bytes = Vec::with_capacity(KEY_MAX_BYTES);
        for word in &self.key {
            bytes.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }

    fn key_string(&self) -> String {
        String::from_utf8_lossy(&self.key_bytes()).into_owned()
    }

    /// Write key and value, then publish the tag. Caller holds the write lock.
    fn publish(&self, tag: u64, key: &[u8], value: i64) {
        for (word, chunk) in self.key.iter().zip(key.chunks(size_of::<u64>())) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            word.store(u64::from_le_bytes(buf), Ordering::Relaxed);
        }
        self.key_len.store(key.len() as u64, Ordering::Relaxed);
        self.value.store(value, Ordering::Relaxed);
        self.tag.store(tag, Ordering::Release);
    }
}

enum Slot<'a> {
    Found(&'a Entry),
    Vacant(&'a Entry),
    Full,
}

/// FNV-1a, tagged so a live entry is never 0.
fn key_tag(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash | 1
}

/// Cross-process counter store backed by a shared region.
pub struct SharedCounterStore {
    region: SharedRegion,
    header: NonNull<StoreHeader>,
    entries: NonNull<Entry>,
    capacity: usize,
}

// SAFETY: header and entries point into `region`, which outlives them and is
// only accessed through atomics.
unsafe impl Send for SharedCounterStore {}
unsafe impl Sync for SharedCounterStore {}

impl SharedCounterStore {
    /// Region size needed for `capacity` keys.
    pub fn region_size(capacity: usize) -> usize {
        HEADER_SIZE + capacity * size_of::<Entry>()
    }

    /// Create a new, empty store file with room for `capacity` keys.
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ClusterError::Config(
                "counter store capacity must be at least 1".to_string(),
            ));
        }
        let region = SharedRegion::create(path, Self::region_size(capacity))?;
        let store = Self::attach(region, capacity)?;
        store.header().capacity.store(capacity as u64, Ordering::Relaxed);
        store.header().magic.store(STORE_MAGIC, Ordering::Release);
        Ok(store)
    }

    /// Open a store created by [`SharedCounterStore::create`], possibly in another process.
    pub fn open(path: &Path) -> Result<Self> {
        let region = SharedRegion::open(path)?;
        let invalid = |reason: String| ClusterError::InvalidRegion {
            path: path.to_path_buf(),
            reason,
        };

        // SAFETY: StoreHeader is repr(C) and made of atomics.
        let header: &StoreHeader = unsafe { region.view(0)? };
        if header.magic.load(Ordering::Acquire) != STORE_MAGIC {
            return Err(invalid("not a counter store".to_string()));
        }
        let capacity = header.capacity.load(Ordering::Relaxed) as usize;
        if capacity == 0 || Self::region_size(capacity) > region.len() {
            return Err(invalid(format!(
                "capacity {} does not fit {} bytes",
                capacity,
                region.len()
            )));
        }
        Self::attach(region, capacity)
    }

    fn attach(region: SharedRegion, capacity: usize) -> Result<Self> {
        // SAFETY: both types are repr(C) atomics; bounds are checked by the region.
        let header = NonNull::from(unsafe { region.view::<StoreHeader>(0)? });
        let entries = NonNull::from(unsafe { region.slice::<Entry>(HEADER_SIZE, capacity)? }).cast();
        Ok(Self {
            region,
            header,
            entries,
            capacity,
        })
    }

    fn header(&self) -> &StoreHeader {
        // SAFETY: validated in `attach`, lives as long as `self.region`.
        unsafe { self.header.as_ref() }
    }

    fn slots(&self) -> &[Entry] {
        // SAFETY: validated in `attach`, lives as long as `self.region`.
        unsafe { std::slice::from_raw_parts(self.entries.as_ptr(), self.capacity) }
    }

    fn find(&self, key: &[u8]) -> Slot<'_> {
        let tag = key_tag(key);
        let slots = self.slots();
        let start = (tag % self.capacity as u64) as usize;
        for i in 0..self.capacity {
            let entry = &slots[(start + i) % self.capacity];
            match entry.tag.load(Ordering::Acquire) {
                0 => return Slot::Vacant(entry),
                t if t == tag && entry.key_matches(key) => return Slot::Found(entry),
                _ => {}
            }
        }
        Slot::Full
    }

    /// Path of the backing file (the handle passed to workers).
    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Maximum number of distinct keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.header().len.load(Ordering::Acquire) as usize
    }

    /// Whether no key has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the store-wide write lock.
    ///
    /// Every read and write made through the returned guard is atomic with
    /// respect to all other holders, in any process.
    pub fn lock_write(&self) -> CounterWriteGuard<'_> {
        CounterWriteGuard {
            store: self,
            _guard: self.header().lock.lock(),
        }
    }

    /// Add `delta` to `key` (missing keys start at 0) and return the new value.
    ///
    /// The lock is held across the whole read-modify-write.
    pub fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut guard = self.lock_write();
        guard.increment(key, delta)
    }

    /// Current value of `key`, without taking the lock.
    pub fn get(&self, key: &str) -> Option<i64> {
        match self.find(key.as_bytes()) {
            Slot::Found(entry) => Some(entry.value.load(Ordering::Relaxed)),
            Slot::Vacant(_) | Slot::Full => None,
        }
    }

    /// All published `(key, value)` pairs, in table order.
    pub fn entries(&self) -> Vec<(String, i64)> {
        self.slots()
            .iter()
            .filter(|entry| entry.tag.load(Ordering::Acquire) != 0)
            .map(|entry| (entry.key_string(), entry.value.load(Ordering::Relaxed)))
            .collect()
    }

    /// Nested view of every key starting with `prefix`.
    ///
    /// `"requests.codes.200" = 3` becomes `{"requests":{"codes":{"200":3}}}`.
    /// If a key is both a leaf and a branch (`a` and `a.b`), the branch wins.
    pub fn snapshot(&self, prefix: &str) -> Value {
        let mut entries: Vec<_> = self
            .entries()
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect();
        entries.sort();

        let mut root = Map::new();
        for (key, value) in &entries {
            let segments: Vec<&str> = key.split('.').collect();
            insert_path(&mut root, &segments, *value);
        }
        Value::Object(root)
    }
}

fn insert_path(node: &mut Map<String, Value>, segments: &[&str], value: i64) {
    match segments {
        [] => {}
        [leaf] => {
            if !matches!(node.get(*leaf), Some(Value::Object(_))) {
                node.insert((*leaf).to_string(), Value::from(value));
            }
        }
        [head, rest @ ..] => {
            let child = node
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

impl std::fmt::Debug for SharedCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCounterStore")
            .field("path", &self.region.path())
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Exclusive access to the store; released on drop.
pub struct CounterWriteGuard<'a> {
    store: &'a SharedCounterStore,
    _guard: WriteGuard<'a>,
}

impl CounterWriteGuard<'_> {
    /// Read `key` under the lock.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.store.get(key)
    }

    /// Write `key`, inserting it if needed.
    pub fn set(&mut self, key: &str, value: i64) -> Result<()> {
        let bytes = key.as_bytes();
        if bytes.len() > KEY_MAX_BYTES {
            return Err(ClusterError::KeyTooLong {
                key: key.to_string(),
                max: KEY_MAX_BYTES,
            });
        }
        if bytes.is_empty() {
            return Err(ClusterError::InvalidKey(key.to_string()));
        }

        match self.store.find(bytes) {
            Slot::Found(entry) => {
                entry.value.store(value, Ordering::Relaxed);
                Ok(())
            }
            Slot::Vacant(entry) => {
                entry.publish(key_tag(bytes), bytes, value);
                self.store.header().len.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Slot::Full => Err(ClusterError::StoreFull {
                capacity: self.store.capacity,
            }),
        }
    }

    /// Read-modify-write of `key` under the already-held lock.
    pub fn increment(&mut self, key: &str, delta: i64) -> Result<i64> {
        let value = self.get(key).unwrap_or(0).wrapping_add(delta);
        self.set(key, value)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store(capacity: usize) -> (tempfile::TempDir, SharedCounterStore) {
        let dir = tempdir().unwrap();
        let store = SharedCounterStore::create(&dir.path().join("counters.shm"), capacity).unwrap();
        (dir, store)
    }

    #[test]
    fn test_increment_and_get() {
        let (_dir, store) = store(16);
        assert_eq!(store.get("requests.total"), None);
        assert_eq!(store.increment("requests.total", 1).unwrap(), 1);
        assert_eq!(store.increment("requests.total", 4).unwrap(), 5);
        assert_eq!(store.increment("requests.total", -2).unwrap(), 3);
        assert_eq!(store.get("requests.total"), Some(3));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_guard_sequence_is_atomic_unit() {
        let (_dir, store) = store(16);
        {
            let mut guard = store.lock_write();
            guard.set("a", 10).unwrap();
            let a = guard.get("a").unwrap();
            guard.set("b", a * 2).unwrap();
        }
        assert_eq!(store.get("b"), Some(20));
    }

    #[test]
    fn test_snapshot_nests_dotted_keys() {
        let (_dir, store) = store(32);
        store.increment("requests.total", 3).unwrap();
        store.increment("requests.codes.200", 2).unwrap();
        store.increment("requests.codes.404", 1).unwrap();
        store.increment("requests.os.linux.browser.firefox", 1).unwrap();
        store.increment("other.thing", 9).unwrap();

        assert_eq!(
            store.snapshot("requests"),
            json!({
                "requests": {
                    "total": 3,
                    "codes": {"200": 2, "404": 1},
                    "os": {"linux": {"browser": {"firefox": 1}}}
                }
            })
        );
        assert_eq!(store.snapshot("nothing"), json!({}));
    }

    #[test]
    fn test_snapshot_branch_wins_over_leaf() {
        let (_dir, store) = store(8);
        store.increment("a", 1).unwrap();
        store.increment("a.b", 2).unwrap();
        assert_eq!(store.snapshot(""), json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_full_store_rejects_new_keys() {
        let (_dir, store) = store(2);
        store.increment("one", 1).unwrap();
        store.increment("two", 1).unwrap();
        assert!(matches!(
            store.increment("three", 1),
            Err(ClusterError::StoreFull { capacity: 2 })
        ));
        // Existing keys still update.
        assert_eq!(store.increment("one", 1).unwrap(), 2);
    }

    #[test]
    fn test_key_limits() {
        let (_dir, store) = store(4);
        let longest = "k".repeat(KEY_MAX_BYTES);
        assert_eq!(store.increment(&longest, 1).unwrap(), 1);
        assert_eq!(store.get(&longest), Some(1));

        let too_long = "k".repeat(KEY_MAX_BYTES + 1);
        assert!(matches!(
            store.increment(&too_long, 1),
            Err(ClusterError::KeyTooLong { .. })
        ));
        assert!(matches!(
            store.increment("", 1),
            Err(ClusterError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_open_sees_same_counters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.shm");
        let writer = SharedCounterStore::create(&path, 64).unwrap();
        let reader = SharedCounterStore::open(&path).unwrap();

        writer.increment("requests.codes.200", 7).unwrap();
        assert_eq!(reader.get("requests.codes.200"), Some(7));
        reader.increment("requests.codes.200", 1).unwrap();
        assert_eq!(writer.get("requests.codes.200"), Some(8));
        assert_eq!(reader.capacity(), 64);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.shm");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();
        assert!(matches!(
            SharedCounterStore::open(&path),
            Err(ClusterError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_colliding_keys_probe_linearly() {
        // Filling every slot forces probes to wrap around the table.
        let (_dir, store) = store(3);
        for key in ["x", "y", "z"] {
            store.increment(key, 1).unwrap();
        }
        let mut entries = store.entries();
        entries.sort();
        assert_eq!(
            entries,
            vec![("x".into(), 1), ("y".into(), 1), ("z".into(), 1)]
        );
    }

    #[test]
    fn test_concurrent_increments_from_many_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.shm");
        let _owner = SharedCounterStore::create(&path, 64).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                // Each thread maps the file separately, like a worker process would.
                let store = Arc::new(SharedCounterStore::open(&path).unwrap());
                std::thread::spawn(move || {
                    for i in 0..500 {
                        store.increment("requests.total", 1).unwrap();
                        store.increment(&format!("requests.codes.{}", 200 + i % 3), 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let store = SharedCounterStore::open(&path).unwrap();
        assert_eq!(store.get("requests.total"), Some(2_000));
        let codes: i64 = (200..203)
            .map(|c| store.get(&format!("requests.codes.{c}")).unwrap())
            .sum();
        assert_eq!(codes, 2_000);
    }
}
