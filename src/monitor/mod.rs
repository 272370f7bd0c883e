//! Load and health monitoring driven by reported request outcomes.

mod health;
mod load;
mod metrics;

pub use health::{HealthMonitor, HealthReport};
pub use load::{LoadLevel, LoadMonitor};
pub use metrics::{LoadMetrics, RequestMetric, RingBuffer, HISTORY_CAPACITY, METRICS_CAPACITY};
