//! Window key generation and handling.

use crate::error::{FloodgateError, Result};

use super::class::RequestClass;

/// A key that uniquely identifies one sliding window.
///
/// Callers, endpoints and per-class global counters live in the same tracker,
/// so the key carries its scope to keep them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WindowKey {
    /// Requests issued by one caller
    Caller(String),
    /// Requests sent to one downstream endpoint
    Endpoint(String),
    /// Requests of one class across all callers
    Global(RequestClass),
}

impl WindowKey {
    /// Key for a caller, rejecting empty identities.
    pub fn caller(caller_id: &str) -> Result<Self> {
        non_empty("caller id", caller_id).map(WindowKey::Caller)
    }

    /// Key for an endpoint, rejecting empty paths.
    pub fn endpoint(endpoint: &str) -> Result<Self> {
        non_empty("endpoint", endpoint).map(WindowKey::Endpoint)
    }

    /// Key for the global counter of a class.
    pub fn global(class: RequestClass) -> Self {
        WindowKey::Global(class)
    }
}

fn non_empty(what: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FloodgateError::InvalidKey(format!("{} must not be empty", what)));
    }
    Ok(trimmed.to_string())
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowKey::Caller(id) => write!(f, "caller:{}", id),
            WindowKey::Endpoint(path) => write!(f, "endpoint:{}", path),
            WindowKey::Global(class) => write!(f, "global:{}", class),
        }
    }
}
