//! File-backed shared memory regions.
//!
//! Every structure that more than one worker mutates lives in a region created
//! here: a file mapped `MAP_SHARED` into each process. The file path is the
//! handle handed to workers through the bootstrap contract; each worker maps
//! the same file, so all of them observe the same memory.
//!
//! Region contents are laid out exclusively as atomics, so a zero-filled file
//! is always a valid (empty) structure and references into the mapping can be
//! shared freely between threads and processes.

#![allow(unsafe_code)]

mod counters;
mod latency;
mod lock;

pub use counters::{CounterWriteGuard, KEY_MAX_BYTES, SharedCounterStore};
pub use latency::LatencyRingBuffer;
pub use lock::{WriteGuard, WriteLock};

use std::fs::OpenOptions;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{ClusterError, Result};

/// A shared, file-backed memory mapping.
pub struct SharedRegion {
    path: PathBuf,
    base: NonNull<u8>,
    len: usize,
    // Keeps the mapping alive for as long as `base` is handed out.
    _mmap: MmapMut,
}

// SAFETY: the mapping is only ever accessed through atomics (see `view`/`slice`),
// which are themselves Send + Sync.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create (or truncate) the file at `path` and map `len` zeroed bytes.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Self::map(path, &file, len)
    }

    /// Map an existing region file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(ClusterError::InvalidRegion {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            });
        }
        Self::map(path, &file, len)
    }

    fn map(path: &Path, file: &std::fs::File, len: usize) -> Result<Self> {
        // SAFETY: the file is owned by this crate's state directory; concurrent
        // modification by other processes is the whole point and is confined to
        // atomic accesses.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| ClusterError::InvalidRegion {
            path: path.to_path_buf(),
            reason: "mapping returned a null pointer".to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            base,
            len,
            _mmap: mmap,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow a `T` at `offset`.
    ///
    /// # Safety
    /// `T` must consist solely of atomics (valid for any bit pattern, including
    /// all zeroes) and be `repr(C)`.
    pub(crate) unsafe fn view<T>(&self, offset: usize) -> Result<&T> {
        self.check_bounds::<T>(offset, 1)?;
        // SAFETY: bounds and alignment checked above; caller guarantees T is
        // made of atomics.
        Ok(unsafe { &*(self.base.as_ptr().add(offset) as *const T) })
    }

    /// Borrow `count` consecutive `T`s starting at `offset`.
    ///
    /// # Safety
    /// Same requirements as [`SharedRegion::view`].
    pub(crate) unsafe fn slice<T>(&self, offset: usize, count: usize) -> Result<&[T]> {
        self.check_bounds::<T>(offset, count)?;
        // SAFETY: bounds and alignment checked above.
        Ok(unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(offset) as *const T, count)
        })
    }

    fn check_bounds<T>(&self, offset: usize, count: usize) -> Result<()> {
        let bytes = size_of::<T>()
            .checked_mul(count)
            .and_then(|n| n.checked_add(offset));
        let in_bounds = matches!(bytes, Some(end) if end <= self.len);
        let aligned = (self.base.as_ptr() as usize + offset) % align_of::<T>() == 0;
        if in_bounds && aligned {
            Ok(())
        } else {
            Err(ClusterError::InvalidRegion {
                path: self.path.clone(),
                reason: format!(
                    "{} x {} bytes at offset {} does not fit a {}-byte mapping",
                    count,
                    size_of::<T>(),
                    offset,
                    self.len
                ),
            })
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}
