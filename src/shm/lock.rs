//! Cross-process write lock living inside a shared region.
//!
//! The lock word holds the pid of the current holder (0 = unlocked). Waiters
//! spin briefly, then yield, then sleep in short steps. While sleeping they
//! periodically probe the holder with `kill(pid, 0)`; a lock whose holder
//! process no longer exists is taken over, so a worker that dies inside a
//! critical section cannot wedge the store forever.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Spins before falling back to `yield_now`.
const SPIN_LIMIT: u32 = 64;
/// Yields before falling back to sleeping.
const YIELD_LIMIT: u32 = 128;
/// Sleep between attempts once contention persists.
const BACKOFF_SLEEP: Duration = Duration::from_micros(50);
/// Attempts between liveness probes of the holder.
const PROBE_EVERY: u32 = 256;

/// A pid-stamped spinlock, `repr(C)` so it can be placed in shared memory.
#[repr(C)]
#[derive(Debug, Default)]
pub struct WriteLock {
    holder: AtomicU32,
}

impl WriteLock {
    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) -> WriteGuard<'_> {
        let me = std::process::id();
        let mut attempts: u32 = 0;

        loop {
            match self
                .holder
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return WriteGuard { lock: self },
                Err(current) => {
                    attempts = attempts.wrapping_add(1);
                    if attempts < SPIN_LIMIT {
                        std::hint::spin_loop();
                    } else if attempts < YIELD_LIMIT {
                        std::thread::yield_now();
                    } else {
                        if attempts % PROBE_EVERY == 0
                            && current != 0
                            && !holder_alive(current)
                            && self
                                .holder
                                .compare_exchange(current, me, Ordering::Acquire, Ordering::Relaxed)
                                .is_ok()
                        {
                            tracing::warn!(
                                dead_holder = current,
                                "Recovered write lock from exited process"
                            );
                            return WriteGuard { lock: self };
                        }
                        std::thread::sleep(BACKOFF_SLEEP);
                    }
                }
            }
        }
    }

    /// Try to acquire the lock without waiting.
    pub fn try_lock(&self) -> Option<WriteGuard<'_>> {
        self.holder
            .compare_exchange(0, std::process::id(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| WriteGuard { lock: self })
    }

    /// Pid of the current holder, if locked.
    pub fn holder(&self) -> Option<u32> {
        match self.holder.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn unlock(&self) {
        self.holder.store(0, Ordering::Release);
    }
}

/// Whether a process with this pid still exists.
fn holder_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM means the process exists but belongs to someone else.
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

/// RAII guard; the lock is released when this is dropped, including during unwinding.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a WriteLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_lock_is_exclusive() {
        let lock = WriteLock::default();
        let guard = lock.lock();
        assert_eq!(lock.holder(), Some(std::process::id()));
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert_eq!(lock.holder(), None);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let lock = Arc::new(WriteLock::default());
        let inner = lock.clone();
        let result = std::thread::spawn(move || {
            let _guard = inner.lock();
            panic!("boom inside critical section");
        })
        .join();
        assert!(result.is_err());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_dead_holder_is_recovered() {
        // Reap a short-lived child so its pid is guaranteed not to be ours.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let lock = WriteLock::default();
        lock.holder.store(dead_pid, Ordering::SeqCst);

        let guard = lock.lock();
        assert_eq!(lock.holder(), Some(std::process::id()));
        drop(guard);
    }

    #[test]
    fn test_live_holder_is_not_stolen() {
        let lock = WriteLock::default();
        // Our own pid is alive; a contender must keep waiting.
        lock.holder.store(std::process::id(), Ordering::SeqCst);
        assert!(lock.try_lock().is_none());
        assert!(holder_alive(std::process::id()));
        lock.unlock();
    }

    #[test]
    fn test_threads_serialize_unsynchronized_counter() {
        let lock = Arc::new(WriteLock::default());
        let value = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let value = value.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let _guard = lock.lock();
                        // Deliberately split load/store: only the lock keeps this correct.
                        let v = value.load(Ordering::Relaxed);
                        value.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(value.load(Ordering::SeqCst), 4_000);
    }
}
