//! System load classification.
//!
//! Completed downstream calls are recorded into a bounded buffer. A periodic
//! tick aggregates the trailing minute and classifies it into a [`LoadLevel`],
//! which the adaptive calculator uses to scale limits. The tick is the only
//! writer of the level; readers take an atomic snapshot.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::metrics::{LoadMetrics, RequestMetric, RingBuffer, HISTORY_CAPACITY, METRICS_CAPACITY};

/// Coarse classification of downstream health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LoadLevel {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl LoadLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoadLevel::Low,
            2 => LoadLevel::High,
            3 => LoadLevel::Critical,
            _ => LoadLevel::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadLevel::Low => "low",
            LoadLevel::Normal => "normal",
            LoadLevel::High => "high",
            LoadLevel::Critical => "critical",
        }
    }

    /// Factor applied to base limits at this level.
    pub fn multiplier(&self) -> f64 {
        match self {
            LoadLevel::Low => 1.3,
            LoadLevel::Normal => 1.0,
            LoadLevel::High => 0.7,
            LoadLevel::Critical => 0.4,
        }
    }

    /// Classify an aggregate given the backpressure queue's fill ratio.
    pub fn classify(
        metrics: &LoadMetrics,
        queue_utilization: f64,
        performance_threshold_ms: f64,
    ) -> Self {
        let latency = metrics.avg_latency_ms;
        let errors = metrics.error_rate;

        if errors > 0.10 || latency > 2.0 * performance_threshold_ms || queue_utilization >= 0.8 {
            LoadLevel::Critical
        } else if errors > 0.05 || latency > performance_threshold_ms || queue_utilization >= 0.5
        {
            LoadLevel::High
        } else if errors < 0.01 && latency < performance_threshold_ms / 2.0 {
            LoadLevel::Low
        } else {
            LoadLevel::Normal
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregates request outcomes and derives the current load level.
pub struct LoadMonitor {
    metrics: RingBuffer<RequestMetric>,
    history: RingBuffer<LoadMetrics>,
    level: AtomicU8,
    /// Set by every recorded outcome, cleared by the tick
    dirty: AtomicBool,
    /// When the current level came into force
    level_since: Mutex<Instant>,
    performance_threshold_ms: f64,
    min_dwell: Duration,
}

impl LoadMonitor {
    pub fn new(performance_threshold_ms: f64, min_dwell: Duration) -> Self {
        Self {
            metrics: RingBuffer::new(METRICS_CAPACITY),
            history: RingBuffer::new(HISTORY_CAPACITY),
            level: AtomicU8::new(LoadLevel::Normal as u8),
            dirty: AtomicBool::new(false),
            level_since: Mutex::new(Instant::now()),
            performance_threshold_ms,
            min_dwell,
        }
    }

    /// Record the outcome of a completed downstream call.
    pub fn record_outcome(
        &self,
        caller_id: &str,
        endpoint: &str,
        latency_ms: f64,
        success: bool,
        now: Instant,
    ) {
        let latency_ms = if latency_ms.is_finite() && latency_ms > 0.0 {
            latency_ms
        } else {
            0.0
        };
        self.metrics.push(RequestMetric {
            timestamp: now,
            latency_ms,
            success,
            endpoint: endpoint.to_string(),
            caller_id: caller_id.to_string(),
        });
        self.dirty.store(true, Ordering::Release);
    }

    pub fn current_load_level(&self) -> LoadLevel {
        LoadLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Aggregate of the trailing window, without touching any state.
    pub fn snapshot(&self, now: Instant) -> LoadMetrics {
        self.metrics.aggregate(now)
    }

    /// The aggregate the last load tick classified, if any outcomes have
    /// been recorded since startup.
    pub fn latest_metrics(&self) -> Option<LoadMetrics> {
        self.history.latest()
    }

    /// Recompute the load level. Called by the periodic load tick.
    ///
    /// With no outcomes in the trailing window and an empty queue there is no
    /// evidence either way, so the level is left as it is.
    pub fn recompute(&self, now: Instant, queue_utilization: f64) -> LoadLevel {
        let fresh = self.dirty.swap(false, Ordering::AcqRel);
        let metrics = self.metrics.aggregate(now);
        if fresh {
            self.history.push(metrics.clone());
        }

        let current = self.current_load_level();
        if metrics.is_empty() && queue_utilization <= 0.0 {
            return current;
        }

        let next = LoadLevel::classify(&metrics, queue_utilization, self.performance_threshold_ms);
        if next == current {
            return current;
        }

        let mut since = self.level_since.lock();
        let dwell = now.saturating_duration_since(*since);
        if dwell < self.min_dwell {
            debug!(
                from = %current,
                to = %next,
                dwell_ms = dwell.as_millis() as u64,
                "Holding load level until minimum dwell elapses"
            );
            return current;
        }

        self.level.store(next as u8, Ordering::Release);
        *since = now;

        if next > current {
            warn!(
                from = %current,
                to = %next,
                error_rate = metrics.error_rate,
                avg_latency_ms = metrics.avg_latency_ms,
                queue_utilization = queue_utilization,
                "Load level rising"
            );
        } else {
            info!(
                from = %current,
                to = %next,
                error_rate = metrics.error_rate,
                avg_latency_ms = metrics.avg_latency_ms,
                "Load level easing"
            );
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(avg_latency_ms: f64, error_rate: f64) -> LoadMetrics {
        LoadMetrics {
            timestamp: chrono::Utc::now(),
            avg_latency_ms,
            error_rate,
            throughput: 1.0,
            sample_count: 100,
        }
    }

    #[test]
    fn test_classify_thresholds() {
        let t = 1000.0;
        assert_eq!(LoadLevel::classify(&metrics(100.0, 0.0), 0.0, t), LoadLevel::Low);
        assert_eq!(LoadLevel::classify(&metrics(600.0, 0.0), 0.0, t), LoadLevel::Normal);
        assert_eq!(LoadLevel::classify(&metrics(100.0, 0.02), 0.0, t), LoadLevel::Normal);
        assert_eq!(LoadLevel::classify(&metrics(1500.0, 0.0), 0.0, t), LoadLevel::High);
        assert_eq!(LoadLevel::classify(&metrics(100.0, 0.06), 0.0, t), LoadLevel::High);
        assert_eq!(LoadLevel::classify(&metrics(2500.0, 0.0), 0.0, t), LoadLevel::Critical);
        assert_eq!(LoadLevel::classify(&metrics(100.0, 0.2), 0.0, t), LoadLevel::Critical);
    }

    #[test]
    fn test_classify_queue_pressure() {
        let t = 1000.0;
        assert_eq!(LoadLevel::classify(&metrics(100.0, 0.0), 0.5, t), LoadLevel::High);
        assert_eq!(LoadLevel::classify(&metrics(100.0, 0.0), 0.8, t), LoadLevel::Critical);
    }

    #[test]
    fn test_multipliers() {
        assert_eq!(LoadLevel::Low.multiplier(), 1.3);
        assert_eq!(LoadLevel::Normal.multiplier(), 1.0);
        assert_eq!(LoadLevel::High.multiplier(), 0.7);
        assert_eq!(LoadLevel::Critical.multiplier(), 0.4);
    }

    #[test]
    fn test_initial_level_is_normal() {
        let monitor = LoadMonitor::new(1000.0, Duration::ZERO);
        assert_eq!(monitor.current_load_level(), LoadLevel::Normal);
        assert_eq!(monitor.recompute(Instant::now(), 0.0), LoadLevel::Normal);
    }

    #[test]
    fn test_sustained_failures_drive_critical() {
        let monitor = LoadMonitor::new(1000.0, Duration::ZERO);
        let now = Instant::now();
        for _ in 0..100 {
            monitor.record_outcome("user", "/v1/orders", 50.0, false, now);
        }
        assert_eq!(monitor.current_load_level(), LoadLevel::Normal);

        assert_eq!(monitor.recompute(now, 0.0), LoadLevel::Critical);
        assert_eq!(monitor.current_load_level(), LoadLevel::Critical);
        let latest = monitor.latest_metrics().unwrap();
        assert_eq!(latest.sample_count, 100);
        assert_eq!(latest.error_rate, 1.0);
    }

    #[test]
    fn test_healthy_traffic_lowers_level() {
        let monitor = LoadMonitor::new(1000.0, Duration::ZERO);
        let now = Instant::now();
        for _ in 0..20 {
            monitor.record_outcome("user", "/v1/products", 120.0, true, now);
        }
        assert_eq!(monitor.recompute(now, 0.0), LoadLevel::Low);
    }

    #[test]
    fn test_history_only_grows_with_new_outcomes() {
        let monitor = LoadMonitor::new(1000.0, Duration::ZERO);
        let now = Instant::now();
        assert_eq!(monitor.latest_metrics(), None);
        monitor.record_outcome("user", "/v1/orders", 10.0, true, now);
        monitor.recompute(now, 0.0);
        assert_eq!(monitor.latest_metrics().unwrap().sample_count, 1);

        // Nothing new arrived, so the empty later aggregate is not kept
        monitor.recompute(now + Duration::from_secs(61), 0.0);
        assert_eq!(monitor.latest_metrics().unwrap().sample_count, 1);
    }

    #[test]
    fn test_min_dwell_holds_level() {
        let monitor = LoadMonitor::new(1000.0, Duration::from_secs(30));
        let start = Instant::now();
        for _ in 0..10 {
            monitor.record_outcome("user", "/v1/orders", 10.0, false, start);
        }
        // Level was set at construction, so the first change is held back
        assert_eq!(monitor.recompute(start, 0.0), LoadLevel::Normal);
        assert_eq!(
            monitor.recompute(start + Duration::from_secs(31), 0.0),
            LoadLevel::Critical
        );
    }

    #[test]
    fn test_invalid_latency_is_clamped() {
        let monitor = LoadMonitor::new(1000.0, Duration::ZERO);
        let now = Instant::now();
        monitor.record_outcome("user", "/v1/orders", f64::NAN, true, now);
        monitor.record_outcome("user", "/v1/orders", -5.0, true, now);
        assert_eq!(monitor.snapshot(now).avg_latency_ms, 0.0);
    }
}
