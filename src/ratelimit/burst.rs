//! Short-horizon burst allowance per caller.
//!
//! The burst gate caps how many requests a caller may issue inside one burst
//! window (10 seconds by default). The allowance is the class's per-minute
//! base scaled by the burst multiplier and cut down to the window's share of
//! a minute, so a caller can briefly run above its steady rate without
//! spending a whole minute's quota in one spike.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::window::{GateCheck, WINDOW};

/// Burst state for one caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstWindow {
    /// When the current burst window opened
    pub window_start: Instant,
    /// Requests admitted in the current burst window
    pub request_count: u64,
    /// Admitted requests that exceeded the steady per-window share
    pub burst_count: u64,
}

impl BurstWindow {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            request_count: 0,
            burst_count: 0,
        }
    }
}

/// Requests a caller may issue in one burst window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstAllowance {
    /// Hard cap for the window, including the burst headroom
    pub limit: u64,
    /// The window's share of the base rate; requests above it count as burst
    pub steady: u64,
}

/// Tracks burst windows for every caller.
pub struct BurstTracker {
    enabled: bool,
    window: Duration,
    callers: DashMap<String, BurstWindow>,
}

impl BurstTracker {
    pub fn new(enabled: bool, window: Duration) -> Self {
        Self {
            enabled,
            window,
            callers: DashMap::new(),
        }
    }

    /// Allowance for a class with the given base rate and multiplier.
    pub fn allowance(&self, base_per_minute: u64, multiplier: f64) -> BurstAllowance {
        let share = self.window.as_secs_f64() / WINDOW.as_secs_f64();
        let steady = base_per_minute as f64 * share;
        BurstAllowance {
            limit: ((steady * multiplier).round() as u64).max(1),
            steady: (steady.round() as u64).max(1),
        }
    }

    /// Check the caller's burst window and count the request if it fits.
    pub fn check_burst(&self, caller_id: &str, allowance: BurstAllowance, now: Instant) -> GateCheck {
        if !self.enabled {
            return GateCheck::allow();
        }

        let mut state = self
            .callers
            .entry(caller_id.to_string())
            .or_insert_with(|| BurstWindow::new(now));

        if now.saturating_duration_since(state.window_start) > self.window {
            *state = BurstWindow::new(now);
        }

        if state.request_count < allowance.limit {
            state.request_count += 1;
            if state.request_count > allowance.steady {
                state.burst_count += 1;
            }
            trace!(
                caller = %caller_id,
                requests = state.request_count,
                bursts = state.burst_count,
                "Burst window updated"
            );
            return GateCheck::allow();
        }

        let elapsed = now.saturating_duration_since(state.window_start);
        GateCheck::deny(self.window.saturating_sub(elapsed))
    }

    /// Current burst state for a caller.
    pub fn state(&self, caller_id: &str) -> Option<BurstWindow> {
        self.callers.get(caller_id).map(|state| *state)
    }

    /// Drop callers whose burst window opened more than `idle_ttl` ago.
    pub fn sweep(&self, now: Instant, idle_ttl: Duration) -> usize {
        let before = self.callers.len();
        self.callers
            .retain(|_, state| now.saturating_duration_since(state.window_start) <= idle_ttl);
        before.saturating_sub(self.callers.len())
    }

    pub fn caller_count(&self) -> usize {
        self.callers.len()
    }
}
