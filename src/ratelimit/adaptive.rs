//! Load-adaptive limit scaling.

use crate::monitor::LoadLevel;

/// Maps a base per-minute limit and a load level to an effective limit.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveCalculator {
    enabled: bool,
}

impl AdaptiveCalculator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Effective limit for `base` at `level`. Never below one request.
    pub fn effective_limit(&self, base: u64, level: LoadLevel) -> u64 {
        if !self.enabled {
            return base;
        }
        ((base as f64 * level.multiplier()).round() as u64).max(1)
    }
}
