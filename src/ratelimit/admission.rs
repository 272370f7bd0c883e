//! Admission control for outbound requests.
//!
//! A request is admitted only when the caller, endpoint and global-class
//! windows and the caller's burst window all have room. Gates run in that
//! order and the first denial wins.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::{FailurePolicy, FloodgateConfig};
use crate::error::Result;
use crate::monitor::{LoadLevel, LoadMonitor};

use super::adaptive::AdaptiveCalculator;
use super::burst::BurstTracker;
use super::class::RequestClass;
use super::key::WindowKey;
use super::window::WindowTracker;

/// Wait suggested to callers denied because the limiter itself failed.
const INTERNAL_ERROR_WAIT: Duration = Duration::from_secs(1);

/// Why an admission decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Allowed,
    CallerLimit,
    EndpointLimit,
    GlobalLimit,
    BurstLimit,
    QueueFull,
    QueueTimeout,
    /// Admitted because the limiter faulted under the open policy
    FailOpen,
    /// Denied because the limiter faulted under the closed policy
    InternalError,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Allowed => "allowed",
            DecisionReason::CallerLimit => "caller_limit",
            DecisionReason::EndpointLimit => "endpoint_limit",
            DecisionReason::GlobalLimit => "global_limit",
            DecisionReason::BurstLimit => "burst_limit",
            DecisionReason::QueueFull => "queue_full",
            DecisionReason::QueueTimeout => "queue_timeout",
            DecisionReason::FailOpen => "fail_open",
            DecisionReason::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer to an admission request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub wait_seconds: f64,
    pub reason: DecisionReason,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            wait_seconds: 0.0,
            reason: DecisionReason::Allowed,
        }
    }

    pub fn deny(reason: DecisionReason, wait: Duration) -> Self {
        Self {
            allowed: false,
            wait_seconds: wait.as_secs_f64(),
            reason,
        }
    }

    /// Suggested wait before retrying.
    pub fn wait(&self) -> Duration {
        Duration::from_secs_f64(self.wait_seconds.max(0.0))
    }
}

impl fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.allowed {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "{}, retry in {:.3}s", self.reason, self.wait_seconds)
        }
    }
}

/// A non-blocking admission check. The backpressure queue re-runs it for
/// every parked caller.
pub trait AdmissionCheck: Send + Sync {
    fn check(&self, caller_id: &str, endpoint: &str, class: RequestClass, now: Instant) -> AdmissionDecision;
}

/// Coordinates the window, burst and adaptive components.
pub struct AdmissionController {
    config: Arc<FloodgateConfig>,
    windows: WindowTracker,
    bursts: BurstTracker,
    load: Arc<LoadMonitor>,
    adaptive: AdaptiveCalculator,
}

impl AdmissionController {
    pub fn new(config: Arc<FloodgateConfig>, load: Arc<LoadMonitor>) -> Self {
        Self {
            windows: WindowTracker::new(config.sweep.max_window_entries),
            bursts: BurstTracker::new(config.burst.enabled, config.burst.window()),
            adaptive: AdaptiveCalculator::new(config.adaptive.enabled),
            load,
            config,
        }
    }

    /// Per-caller and per-endpoint limit for a class at the current load level.
    pub fn effective_limit(&self, class: RequestClass) -> u64 {
        self.effective_limit_at(class, self.load.current_load_level())
    }

    fn effective_limit_at(&self, class: RequestClass, level: LoadLevel) -> u64 {
        let base = self.config.class_limit(class).requests_per_minute;
        self.adaptive.effective_limit(base, level)
    }

    /// Global limit for a class at the current load level.
    pub fn global_limit(&self, class: RequestClass) -> u64 {
        let base = self.config.class_limit(class).global_per_minute();
        self.adaptive
            .effective_limit(base, self.load.current_load_level())
    }

    /// Decide whether a request may go out now. Never blocks.
    pub fn check_admission(
        &self,
        caller_id: &str,
        endpoint: &str,
        class: RequestClass,
        now: Instant,
    ) -> AdmissionDecision {
        match self.evaluate(caller_id, endpoint, class, now) {
            Ok(decision) => decision,
            Err(e) => match self.config.failure_policy {
                FailurePolicy::Open => {
                    error!(
                        caller = %caller_id,
                        endpoint = %endpoint,
                        class = %class,
                        error = %e,
                        "Admission check failed, admitting request"
                    );
                    AdmissionDecision {
                        allowed: true,
                        wait_seconds: 0.0,
                        reason: DecisionReason::FailOpen,
                    }
                }
                FailurePolicy::Closed => {
                    error!(
                        caller = %caller_id,
                        endpoint = %endpoint,
                        class = %class,
                        error = %e,
                        "Admission check failed, denying request"
                    );
                    AdmissionDecision::deny(DecisionReason::InternalError, INTERNAL_ERROR_WAIT)
                }
            },
        }
    }

    fn evaluate(
        &self,
        caller_id: &str,
        endpoint: &str,
        class: RequestClass,
        now: Instant,
    ) -> Result<AdmissionDecision> {
        let caller_key = WindowKey::caller(caller_id)?;
        let endpoint_key = WindowKey::endpoint(endpoint)?;
        let global_key = WindowKey::global(class);

        let level = self.load.current_load_level();
        let limit = self.effective_limit_at(class, level);
        let class_limit = self.config.class_limit(class);
        let global_limit = self
            .adaptive
            .effective_limit(class_limit.global_per_minute(), level);

        let gates = [
            (&caller_key, limit, DecisionReason::CallerLimit),
            (&endpoint_key, limit, DecisionReason::EndpointLimit),
            (&global_key, global_limit, DecisionReason::GlobalLimit),
        ];

        let mut reserved: Vec<&WindowKey> = Vec::with_capacity(gates.len());
        for (key, limit, reason) in gates {
            let check = match self.windows.check_and_reserve(key, limit, now) {
                Ok(check) => check,
                Err(e) => {
                    self.release(&reserved, now);
                    return Err(e);
                }
            };
            if !check.allowed {
                self.release(&reserved, now);
                debug!(
                    key = %key,
                    limit = limit,
                    level = %level,
                    wait_ms = check.wait.as_millis() as u64,
                    "Request denied by window"
                );
                return Ok(AdmissionDecision::deny(reason, check.wait));
            }
            reserved.push(key);
        }

        let allowance = self
            .bursts
            .allowance(class_limit.requests_per_minute, self.config.burst_multiplier(class));
        let burst = self.bursts.check_burst(caller_id.trim(), allowance, now);
        if !burst.allowed {
            self.release(&reserved, now);
            debug!(
                caller = %caller_key,
                allowance = allowance.limit,
                wait_ms = burst.wait.as_millis() as u64,
                "Request denied by burst window"
            );
            return Ok(AdmissionDecision::deny(DecisionReason::BurstLimit, burst.wait));
        }

        Ok(AdmissionDecision::allow())
    }

    /// Undo reservations taken by earlier gates for a denied request.
    fn release(&self, keys: &[&WindowKey], now: Instant) {
        for key in keys {
            self.windows.release(key, now);
        }
    }

    /// Requests admitted for a caller in the trailing minute.
    pub fn caller_requests(&self, caller_id: &str, now: Instant) -> Option<usize> {
        WindowKey::caller(caller_id)
            .ok()
            .map(|key| self.windows.count(&key, now))
    }

    /// Requests admitted to an endpoint in the trailing minute.
    pub fn endpoint_requests(&self, endpoint: &str, now: Instant) -> Option<usize> {
        WindowKey::endpoint(endpoint)
            .ok()
            .map(|key| self.windows.count(&key, now))
    }

    /// Drop idle window and burst keys. Returns the number of keys removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let ttl = self.config.sweep.idle_key_ttl();
        let windows = self.windows.sweep(now, ttl);
        let bursts = self.bursts.sweep(now, ttl);
        if windows + bursts > 0 {
            debug!(
                windows = windows,
                bursts = bursts,
                remaining = self.windows.key_count(),
                "Swept idle rate limit keys"
            );
        }
        windows + bursts
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.key_count()
    }

    pub fn load(&self) -> &Arc<LoadMonitor> {
        &self.load
    }

    pub fn config(&self) -> &Arc<FloodgateConfig> {
        &self.config
    }
}

impl AdmissionCheck for AdmissionController {
    fn check(&self, caller_id: &str, endpoint: &str, class: RequestClass, now: Instant) -> AdmissionDecision {
        self.check_admission(caller_id, endpoint, class, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ClassLimit;

    fn controller_with(config: FloodgateConfig) -> AdmissionController {
        let load = Arc::new(LoadMonitor::new(
            config.thresholds.performance_threshold_ms,
            Duration::ZERO,
        ));
        AdmissionController::new(Arc::new(config), load)
    }

    fn no_burst_config() -> FloodgateConfig {
        let mut config = FloodgateConfig::default();
        config.burst.enabled = false;
        config
    }

    #[test]
    fn test_sixty_instant_requests_then_denied() {
        let controller = controller_with(no_burst_config());
        let now = Instant::now();

        for i in 0..60 {
            let decision = controller.check_admission("user", "/v1/orders", RequestClass::Default, now);
            assert!(decision.allowed, "request {} should be allowed", i + 1);
            assert_eq!(decision.reason, DecisionReason::Allowed);
        }

        let decision = controller.check_admission("user", "/v1/orders", RequestClass::Default, now);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::CallerLimit);
        assert!((decision.wait_seconds - 60.0).abs() < 0.01);
        assert_eq!(controller.caller_requests("user", now), Some(60));
    }

    #[test]
    fn test_retry_after_wait_is_admitted() {
        let controller = controller_with(no_burst_config());
        let start = Instant::now();
        for _ in 0..60 {
            controller.check_admission("user", "/v1/orders", RequestClass::Default, start);
        }

        let later = start + Duration::from_secs(25);
        let denied = controller.check_admission("user", "/v1/orders", RequestClass::Default, later);
        assert!(!denied.allowed);

        let retry = later + denied.wait() + Duration::from_millis(5);
        let decision = controller.check_admission("user", "/v1/orders", RequestClass::Default, retry);
        assert!(decision.allowed);
    }

    #[test]
    fn test_endpoint_limit_spans_callers() {
        let controller = controller_with(no_burst_config());
        let now = Instant::now();
        for _ in 0..60 {
            controller.check_admission("alice", "/v1/orders", RequestClass::Default, now);
        }

        let decision = controller.check_admission("bob", "/v1/orders", RequestClass::Default, now);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::EndpointLimit);
        // Bob's caller reservation was rolled back
        assert_eq!(controller.caller_requests("bob", now), Some(0));
    }

    #[test]
    fn test_one_caller_does_not_exhaust_class() {
        let controller = controller_with(no_burst_config());
        let now = Instant::now();
        for _ in 0..60 {
            assert!(controller
                .check_admission("heavy", "/v1/orders/1", RequestClass::Orders, now)
                .allowed);
        }
        let decision = controller.check_admission("heavy", "/v1/orders/1", RequestClass::Orders, now);
        assert_eq!(decision.reason, DecisionReason::CallerLimit);

        let decision = controller.check_admission("light", "/v1/orders/2", RequestClass::Orders, now);
        assert!(decision.allowed);
        assert_eq!(controller.global_limit(RequestClass::Orders), 600);
    }

    #[test]
    fn test_global_limit_spans_callers_and_endpoints() {
        let controller = controller_with(no_burst_config());
        let now = Instant::now();
        for i in 0..600 {
            let caller = format!("user-{}", i);
            let endpoint = format!("/v1/orders/{}", i);
            assert!(controller
                .check_admission(&caller, &endpoint, RequestClass::Orders, now)
                .allowed);
        }

        let decision = controller.check_admission("late", "/v1/other", RequestClass::Orders, now);
        assert_eq!(decision.reason, DecisionReason::GlobalLimit);
        assert_eq!(controller.caller_requests("late", now), Some(0));
        assert_eq!(controller.endpoint_requests("/v1/other", now), Some(0));

        // Other classes have their own global window
        let decision = controller.check_admission("late", "/v1/other", RequestClass::Products, now);
        assert!(decision.allowed);
    }

    #[test]
    fn test_burst_exhaustion() {
        let controller = controller_with(FloodgateConfig::default());
        let now = Instant::now();

        // 60/min with a 1.5 multiplier gives 15 per 10 seconds
        for _ in 0..15 {
            assert!(controller
                .check_admission("user", "/v1/orders", RequestClass::Default, now)
                .allowed);
        }
        let decision = controller.check_admission("user", "/v1/orders", RequestClass::Default, now);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::BurstLimit);
        assert!((decision.wait_seconds - 10.0).abs() < 0.01);
        assert_eq!(controller.caller_requests("user", now), Some(15));
    }

    #[test]
    fn test_effective_limit_follows_load() {
        let controller = controller_with(FloodgateConfig::default());
        assert_eq!(controller.effective_limit(RequestClass::Default), 60);

        let now = Instant::now();
        for _ in 0..100 {
            controller.load().record_outcome("user", "/v1/orders", 10.0, false, now);
        }
        controller.load().recompute(now, 0.0);
        assert_eq!(controller.effective_limit(RequestClass::Default), 24);
    }

    #[test]
    fn test_configured_global_limit() {
        let mut config = no_burst_config();
        config.classes.insert(
            RequestClass::Inventory,
            ClassLimit {
                global_requests_per_minute: Some(2),
                ..ClassLimit::per_minute(10)
            },
        );
        let controller = controller_with(config);
        let now = Instant::now();
        assert_eq!(controller.global_limit(RequestClass::Inventory), 2);

        controller.check_admission("a", "/x", RequestClass::Inventory, now);
        controller.check_admission("b", "/y", RequestClass::Inventory, now);
        let decision = controller.check_admission("c", "/z", RequestClass::Inventory, now);
        assert_eq!(decision.reason, DecisionReason::GlobalLimit);
    }

    #[test]
    fn test_fails_open_on_invalid_key() {
        let controller = controller_with(FloodgateConfig::default());
        let decision = controller.check_admission("", "/v1/orders", RequestClass::Default, Instant::now());
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::FailOpen);
    }

    #[test]
    fn test_fails_closed_when_configured() {
        let mut config = FloodgateConfig::default();
        config.failure_policy = FailurePolicy::Closed;
        let controller = controller_with(config);
        let decision = controller.check_admission("user", "", RequestClass::Default, Instant::now());
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::InternalError);
        assert_eq!(decision.wait(), INTERNAL_ERROR_WAIT);
    }

    #[test]
    fn test_sweep_removes_idle_keys() {
        let controller = controller_with(FloodgateConfig::default());
        let start = Instant::now();
        controller.check_admission("user", "/v1/orders", RequestClass::Default, start);
        assert_eq!(controller.tracked_keys(), 3);

        let removed = controller.sweep(start + Duration::from_secs(301));
        assert_eq!(removed, 4);
        assert_eq!(controller.tracked_keys(), 0);
    }

    #[test]
    fn test_decision_serializes_reason() {
        let decision = AdmissionDecision::deny(DecisionReason::QueueTimeout, Duration::from_millis(1500));
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["reason"], "queue_timeout");
        assert_eq!(json["wait_seconds"], 1.5);
        assert_eq!(json["allowed"], false);
    }
}
