//! Floodgate - Adaptive Admission Control
//!
//! This crate protects a shared marketplace API from its own clients. Every
//! outbound call asks the [`ratelimit::RateLimiter`] for admission first; the
//! limiter enforces per-caller, per-endpoint and global sliding windows plus
//! short burst windows, and scales its limits with the load it observes from
//! reported call outcomes. Callers that would rather wait than fail can park
//! in a bounded backpressure queue.

pub mod config;
pub mod error;
pub mod monitor;
pub mod ratelimit;
pub mod tasks;
