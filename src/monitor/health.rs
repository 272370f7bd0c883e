//! Limiter self-health.
//!
//! The health flag is an external readiness surface only; admission decisions
//! never consult it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use super::metrics::LoadMetrics;

/// Result of the most recent health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub checked_at: DateTime<Utc>,
}

/// Flags the limiter unhealthy when recent errors or latency are too high.
pub struct HealthMonitor {
    healthy: AtomicBool,
    error_rate_threshold: f64,
    performance_threshold_ms: f64,
    last_report: RwLock<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(error_rate_threshold: f64, performance_threshold_ms: f64) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            error_rate_threshold,
            performance_threshold_ms,
            last_report: RwLock::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().clone()
    }

    /// Evaluate a trailing-window aggregate and update the flag.
    pub fn check(&self, metrics: &LoadMetrics) -> bool {
        let healthy = metrics.error_rate <= self.error_rate_threshold
            && metrics.avg_latency_ms <= 2.0 * self.performance_threshold_ms;

        let was_healthy = self.healthy.swap(healthy, Ordering::AcqRel);
        if was_healthy && !healthy {
            warn!(
                error_rate = metrics.error_rate,
                avg_latency_ms = metrics.avg_latency_ms,
                "Rate limiter marked unhealthy"
            );
        } else if !was_healthy && healthy {
            info!("Rate limiter healthy again");
        }

        *self.last_report.write() = Some(HealthReport {
            healthy,
            error_rate: metrics.error_rate,
            avg_latency_ms: metrics.avg_latency_ms,
            checked_at: metrics.timestamp,
        });
        healthy
    }
}
