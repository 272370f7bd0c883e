//! Request outcome records and rolling aggregates.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;

use crate::ratelimit::WINDOW;

/// Capacity of the request outcome buffer.
pub const METRICS_CAPACITY: usize = 10_000;
/// Capacity of the aggregate history.
pub const HISTORY_CAPACITY: usize = 1_000;

/// Outcome of one completed downstream call.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub timestamp: Instant,
    pub latency_ms: f64,
    pub success: bool,
    pub endpoint: String,
    pub caller_id: String,
}

/// Aggregate over the outcomes recorded in the trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadMetrics {
    pub timestamp: DateTime<Utc>,
    pub avg_latency_ms: f64,
    /// Fraction of failed calls, between 0 and 1
    pub error_rate: f64,
    /// Completed calls per second
    pub throughput: f64,
    pub sample_count: usize,
}

impl LoadMetrics {
    /// Aggregate the given samples.
    pub fn from_samples<'a, I>(samples: I) -> Self
    where
        I: IntoIterator<Item = &'a RequestMetric>,
    {
        let mut count = 0usize;
        let mut failures = 0usize;
        let mut total_latency = 0.0;

        for sample in samples {
            count += 1;
            total_latency += sample.latency_ms;
            if !sample.success {
                failures += 1;
            }
        }

        let (avg_latency_ms, error_rate) = if count == 0 {
            (0.0, 0.0)
        } else {
            (total_latency / count as f64, failures as f64 / count as f64)
        };

        Self {
            timestamp: Utc::now(),
            avg_latency_ms,
            error_rate,
            throughput: count as f64 / WINDOW.as_secs_f64(),
            sample_count: count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// Bounded buffer that evicts its oldest entry when full.
pub struct RingBuffer<T> {
    capacity: usize,
    entries: RwLock<VecDeque<T>>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, entry: T) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<T> {
        self.entries.read().back().cloned()
    }
}

impl RingBuffer<RequestMetric> {
    /// Aggregate the outcomes recorded in the window ending at `now`.
    pub fn aggregate(&self, now: Instant) -> LoadMetrics {
        let entries = self.entries.read();
        LoadMetrics::from_samples(
            entries
                .iter()
                .rev()
                .take_while(|m| now.saturating_duration_since(m.timestamp) <= WINDOW),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn metric(at: Instant, latency_ms: f64, success: bool) -> RequestMetric {
        RequestMetric {
            timestamp: at,
            latency_ms,
            success,
            endpoint: "/v1/orders".to_string(),
            caller_id: "user".to_string(),
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let buffer = RingBuffer::new(3);
        for i in 0..5 {
            buffer.push(i);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.latest(), Some(4));
        assert_eq!(*buffer.entries.read(), VecDeque::from(vec![2, 3, 4]));
    }

    #[test]
    fn test_aggregate_over_trailing_window() {
        let buffer = RingBuffer::new(METRICS_CAPACITY);
        let start = Instant::now();
        buffer.push(metric(start, 5000.0, false));
        let now = start + Duration::from_secs(90);
        buffer.push(metric(now - Duration::from_secs(10), 100.0, true));
        buffer.push(metric(now - Duration::from_secs(5), 300.0, false));

        let metrics = buffer.aggregate(now);
        assert_eq!(metrics.sample_count, 2);
        assert_eq!(metrics.avg_latency_ms, 200.0);
        assert_eq!(metrics.error_rate, 0.5);
        assert!((metrics.throughput - 2.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_aggregate() {
        let buffer: RingBuffer<RequestMetric> = RingBuffer::new(10);
        let metrics = buffer.aggregate(Instant::now());
        assert!(metrics.is_empty());
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.avg_latency_ms, 0.0);
    }
}
