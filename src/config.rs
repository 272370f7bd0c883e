//! Configuration management for Floodgate.
//!
//! Configuration is loaded once at startup and is immutable afterwards.
//! Values come from an optional YAML file, overlaid by `FLOODGATE__*`
//! environment variables (`FLOODGATE__QUEUE__CAPACITY=500`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{ClassLimit, RequestClass, DEFAULT_BURST_MULTIPLIER};

/// Main configuration for the limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Per-class base limits; classes not listed use built-in limits
    #[serde(default)]
    pub classes: BTreeMap<RequestClass, ClassLimit>,

    /// Burst allowance configuration
    #[serde(default)]
    pub burst: BurstConfig,

    /// Load-adaptive limit configuration
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Latency and error-rate thresholds
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    /// Backpressure queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Health monitor configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Idle-key sweep configuration
    #[serde(default)]
    pub sweep: SweepConfig,

    /// What the admission controller does on an internal fault
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Burst allowance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurstConfig {
    /// Whether the burst gate is active
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Multiplier applied to the base rate for the burst slice
    #[serde(default = "default_burst_multiplier")]
    pub multiplier: f64,

    /// Length of the burst window in seconds
    #[serde(default = "default_burst_window")]
    pub window_secs: u64,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multiplier: default_burst_multiplier(),
            window_secs: default_burst_window(),
        }
    }
}

impl BurstConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Load-adaptive limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Whether limits follow the current load level
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the load level is recomputed, in seconds
    #[serde(default = "default_load_check_interval")]
    pub load_check_interval_secs: u64,

    /// Minimum time a load level stays in force before it may change (0 disables)
    #[serde(default)]
    pub min_dwell_secs: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            load_check_interval_secs: default_load_check_interval(),
            min_dwell_secs: 0,
        }
    }
}

impl AdaptiveConfig {
    pub fn load_check_interval(&self) -> Duration {
        Duration::from_secs(self.load_check_interval_secs)
    }

    pub fn min_dwell(&self) -> Duration {
        Duration::from_secs(self.min_dwell_secs)
    }
}

/// Latency and error-rate thresholds shared by the load and health monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Average latency considered acceptable, in milliseconds
    #[serde(default = "default_performance_threshold")]
    pub performance_threshold_ms: f64,

    /// Error rate above which the limiter reports itself unhealthy
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            performance_threshold_ms: default_performance_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
        }
    }
}

/// Backpressure queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Whether denied callers may wait in the queue
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of pending entries
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Default wait bound for callers that do not supply one, in milliseconds
    #[serde(default = "default_queue_timeout")]
    pub timeout_ms: u64,

    /// Upper bound on how long the worker sleeps between re-checks, in milliseconds
    #[serde(default = "default_queue_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_queue_capacity(),
            timeout_ms: default_queue_timeout(),
            poll_interval_ms: default_queue_poll_interval(),
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often the health check runs, in seconds
    #[serde(default = "default_health_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_health_check_interval(),
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Idle-key sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// How often stale keys are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Keys idle for longer than this are dropped, in seconds
    #[serde(default = "default_idle_key_ttl")]
    pub idle_key_ttl_secs: u64,

    /// Hard cap on timestamps retained per window
    #[serde(default = "default_max_window_entries")]
    pub max_window_entries: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            idle_key_ttl_secs: default_idle_key_ttl(),
            max_window_entries: default_max_window_entries(),
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_key_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_key_ttl_secs)
    }
}

/// Behaviour of the admission controller when its own state is faulty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    Open,
    /// Deny the request
    Closed,
}

fn default_true() -> bool {
    true
}

fn default_burst_multiplier() -> f64 {
    DEFAULT_BURST_MULTIPLIER
}

fn default_burst_window() -> u64 {
    10
}

fn default_load_check_interval() -> u64 {
    30
}

fn default_performance_threshold() -> f64 {
    1000.0
}

fn default_error_rate_threshold() -> f64 {
    0.1
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_queue_timeout() -> u64 {
    30_000
}

fn default_queue_poll_interval() -> u64 {
    50
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_idle_key_ttl() -> u64 {
    300
}

fn default_max_window_entries() -> usize {
    10_000
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file overlaid with `FLOODGATE__*`
    /// environment variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading limiter configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        let config: FloodgateConfig = builder
            .add_source(
                ::config::Environment::with_prefix("FLOODGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Limits for a class, falling back to the built-in table.
    pub fn class_limit(&self, class: RequestClass) -> ClassLimit {
        self.classes
            .get(&class)
            .cloned()
            .unwrap_or_else(|| class.builtin_limit())
    }

    /// Burst multiplier for a class.
    pub fn burst_multiplier(&self, class: RequestClass) -> f64 {
        self.class_limit(class)
            .burst_multiplier
            .unwrap_or(self.burst.multiplier)
    }

    /// Reject configurations the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (class, limit) in &self.classes {
            if limit.requests_per_minute == 0 {
                return Err(invalid(format!(
                    "classes.{}.requests_per_minute must be positive",
                    class
                )));
            }
            if limit.global_requests_per_minute == Some(0) {
                return Err(invalid(format!(
                    "classes.{}.global_requests_per_minute must be positive",
                    class
                )));
            }
            if let Some(multiplier) = limit.burst_multiplier {
                check_positive(&format!("classes.{}.burst_multiplier", class), multiplier)?;
            }
        }

        check_positive("burst.multiplier", self.burst.multiplier)?;
        if self.burst.window_secs == 0 || self.burst.window_secs > 60 {
            return Err(invalid("burst.window_secs must be between 1 and 60"));
        }

        if self.adaptive.load_check_interval_secs == 0 {
            return Err(invalid("adaptive.load_check_interval_secs must be positive"));
        }

        check_positive(
            "thresholds.performance_threshold_ms",
            self.thresholds.performance_threshold_ms,
        )?;
        let rate = self.thresholds.error_rate_threshold;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(invalid("thresholds.error_rate_threshold must be in (0, 1]"));
        }

        if self.queue.capacity == 0 {
            return Err(invalid("queue.capacity must be positive"));
        }
        if self.queue.timeout_ms == 0 || self.queue.poll_interval_ms == 0 {
            return Err(invalid("queue timeouts must be positive"));
        }

        if self.health.check_interval_secs == 0 {
            return Err(invalid("health.check_interval_secs must be positive"));
        }

        if self.sweep.interval_secs == 0 || self.sweep.idle_key_ttl_secs == 0 {
            return Err(invalid("sweep intervals must be positive"));
        }
        if self.sweep.max_window_entries == 0 {
            return Err(invalid("sweep.max_window_entries must be positive"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> FloodgateError {
    FloodgateError::Config(message.into())
}

fn check_positive(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{} must be a positive number", field)))
    }
}
