//! Sliding-window request tracking.
//!
//! Each key owns an ordered list of the instants at which requests were
//! admitted. Entries older than [`WINDOW`] are purged lazily whenever the key
//! is checked, so the retained count is the number of admissions in the
//! trailing minute.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{FloodgateError, Result};

use super::key::WindowKey;

/// Length of every sliding window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a single gate check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateCheck {
    /// Whether the gate lets the request through
    pub allowed: bool,
    /// How long until the gate would let it through
    pub wait: Duration,
}

impl GateCheck {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
        }
    }

    pub fn deny(wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
        }
    }
}

/// Admission timestamps for one key.
#[derive(Debug)]
pub struct SlidingWindow {
    /// Admission instants, oldest first
    timestamps: VecDeque<Instant>,
    /// Last time this key was checked
    last_seen: Instant,
}

impl SlidingWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            timestamps: VecDeque::new(),
            last_seen: now,
        }
    }

    /// Drop timestamps that fell out of the trailing window.
    fn purge(&mut self, now: Instant) {
        while let Some(front) = self.timestamps.front() {
            if now.saturating_duration_since(*front) > WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Purge, then record `now` if fewer than `limit` requests remain.
    pub fn check_and_reserve(&mut self, limit: usize, now: Instant) -> GateCheck {
        self.last_seen = self.last_seen.max(now);
        self.purge(now);

        if self.timestamps.len() < limit {
            // Callers capture `now` before taking the shard lock, so keep the
            // sequence ordered even when they arrive slightly out of order.
            let at = self.timestamps.back().map_or(now, |back| now.max(*back));
            self.timestamps.push_back(at);
            return GateCheck::allow();
        }

        let wait = self
            .timestamps
            .front()
            .map(|oldest| WINDOW.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(Duration::ZERO);
        GateCheck::deny(wait)
    }

    /// Undo a reservation taken at `at`. Returns whether one was found.
    pub fn release(&mut self, at: Instant) -> bool {
        match self.timestamps.iter().rposition(|ts| *ts >= at) {
            Some(index) => {
                self.timestamps.remove(index);
                true
            }
            None => false,
        }
    }

    /// Requests admitted in the window ending at `now`, without purging.
    pub fn count(&self, now: Instant) -> usize {
        self.timestamps
            .iter()
            .filter(|ts| now.saturating_duration_since(**ts) <= WINDOW)
            .count()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Sliding windows for every caller, endpoint and global class.
///
/// The map is sharded; holding a shard entry while purging and appending
/// linearises all mutations of a single key.
pub struct WindowTracker {
    windows: DashMap<WindowKey, SlidingWindow>,
    /// Hard cap on timestamps retained per key
    max_entries: usize,
}

impl WindowTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_entries,
        }
    }

    /// Check `key` against `limit` and reserve a slot if it is under.
    pub fn check_and_reserve(&self, key: &WindowKey, limit: u64, now: Instant) -> Result<GateCheck> {
        if limit == 0 {
            return Err(FloodgateError::Internal(format!(
                "window {} evaluated with a zero limit",
                key
            )));
        }
        let limit = usize::try_from(limit)
            .unwrap_or(usize::MAX)
            .min(self.max_entries);

        let mut window = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| SlidingWindow::new(now));
        let check = window.check_and_reserve(limit, now);

        if window.len() > self.max_entries {
            return Err(FloodgateError::Internal(format!(
                "window {} holds {} entries, above the cap of {}",
                key,
                window.len(),
                self.max_entries
            )));
        }

        trace!(
            key = %key,
            limit = limit,
            count = window.len(),
            allowed = check.allowed,
            "Checked sliding window"
        );
        Ok(check)
    }

    /// Release a reservation taken at `at` for `key`.
    pub fn release(&self, key: &WindowKey, at: Instant) {
        if let Some(mut window) = self.windows.get_mut(key) {
            window.release(at);
        }
    }

    /// Requests admitted for `key` in the trailing window.
    pub fn count(&self, key: &WindowKey, now: Instant) -> usize {
        self.windows
            .get(key)
            .map(|window| window.count(now))
            .unwrap_or(0)
    }

    /// Drop keys that are empty after purging or idle for longer than `idle_ttl`.
    ///
    /// Returns the number of keys removed.
    pub fn sweep(&self, now: Instant, idle_ttl: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.purge(now);
            !window.is_empty() && now.saturating_duration_since(window.last_seen) <= idle_ttl
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}
