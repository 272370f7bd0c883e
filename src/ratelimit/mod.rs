//! Admission control: sliding windows, burst tracking, adaptive limits and
//! the backpressure queue.

mod adaptive;
mod admission;
mod backend;
mod burst;
mod class;
mod key;
mod limiter;
mod queue;
mod window;

pub use adaptive::AdaptiveCalculator;
pub use admission::{AdmissionCheck, AdmissionController, AdmissionDecision, DecisionReason};
pub use backend::{guarded_call, AdmissionBackend, CallError};
pub use burst::{BurstAllowance, BurstTracker, BurstWindow};
pub use class::{ClassLimit, RequestClass, DEFAULT_BURST_MULTIPLIER, DEFAULT_GLOBAL_FACTOR};
pub use key::WindowKey;
pub use limiter::{LimiterStatus, RateLimiter};
pub use queue::BackpressureQueue;
pub use window::{GateCheck, SlidingWindow, WindowTracker, WINDOW};
