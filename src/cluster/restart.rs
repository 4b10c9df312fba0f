//! Crash restart budget with exponential backoff.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How crashed workers are replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed per slot within `window`.
    pub max_restarts: u32,
    pub window: Duration,
    /// Delay before the first restart; doubles per recent restart.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Restart history of one slot.
#[derive(Debug, Default)]
pub struct RestartTracker {
    recent: VecDeque<Instant>,
}

impl RestartTracker {
    /// Record a crash at `now`. Returns the delay before respawning, or
    /// `None` when the slot has used its budget for the window.
    pub fn next_delay(&mut self, policy: &RestartPolicy, now: Instant) -> Option<Duration> {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) > policy.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= policy.max_restarts as usize {
            return None;
        }
        let delay = policy.backoff(self.recent.len() as u32);
        self.recent.push_back(now);
        Some(delay)
    }

    /// Restarts counted in the current window.
    pub fn recent(&self) -> usize {
        self.recent.len()
    }
}
