//! Request classes and their configured base limits.
//!
//! Every outbound call to the marketplace gateway is tagged with a request
//! class. The class selects the per-minute base limit that the adaptive
//! calculator scales and the burst multiplier the burst tracker applies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Default burst multiplier when neither the class nor the burst section sets one.
pub const DEFAULT_BURST_MULTIPLIER: f64 = 1.5;

/// Global limit of a class, as a multiple of its per-caller base limit, when
/// none is configured.
pub const DEFAULT_GLOBAL_FACTOR: u64 = 10;

/// Category of downstream request, used to select limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestClass {
    Orders,
    Products,
    Inventory,
    Default,
}

impl RequestClass {
    /// All known classes, in a stable order.
    pub const ALL: [RequestClass; 4] = [
        RequestClass::Orders,
        RequestClass::Products,
        RequestClass::Inventory,
        RequestClass::Default,
    ];

    /// The lowercase name used in keys, logs and status snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestClass::Orders => "orders",
            RequestClass::Products => "products",
            RequestClass::Inventory => "inventory",
            RequestClass::Default => "default",
        }
    }

    /// Resolve a class name supplied by a caller.
    ///
    /// Unknown names fall back to [`RequestClass::Default`] rather than failing,
    /// so a typo in a collaborator never bypasses limiting.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            debug!(class = %name, "Unknown request class, using default");
            RequestClass::Default
        })
    }

    /// Built-in limits used when the configuration omits this class.
    pub fn builtin_limit(&self) -> ClassLimit {
        let requests_per_minute = match self {
            RequestClass::Orders => 60,
            RequestClass::Products => 120,
            RequestClass::Inventory => 90,
            RequestClass::Default => 60,
        };
        ClassLimit {
            requests_per_minute,
            global_requests_per_minute: None,
            burst_multiplier: None,
        }
    }
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orders" => Ok(RequestClass::Orders),
            "products" => Ok(RequestClass::Products),
            "inventory" => Ok(RequestClass::Inventory),
            "default" => Ok(RequestClass::Default),
            other => Err(format!("unknown request class '{}'", other)),
        }
    }
}

/// Limits configured for one request class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassLimit {
    /// Base requests allowed per minute, per caller and per endpoint
    pub requests_per_minute: u64,
    /// Requests per minute across all callers; defaults to
    /// [`DEFAULT_GLOBAL_FACTOR`] times the base limit
    #[serde(default)]
    pub global_requests_per_minute: Option<u64>,
    /// Overrides the burst section's multiplier for this class
    #[serde(default)]
    pub burst_multiplier: Option<f64>,
}

impl ClassLimit {
    /// Create a limit with only a base rate.
    pub fn per_minute(requests_per_minute: u64) -> Self {
        Self {
            requests_per_minute,
            global_requests_per_minute: None,
            burst_multiplier: None,
        }
    }

    /// The global base limit for the class.
    pub fn global_per_minute(&self) -> u64 {
        self.global_requests_per_minute
            .unwrap_or_else(|| self.requests_per_minute.saturating_mul(DEFAULT_GLOBAL_FACTOR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_classes() {
        assert_eq!("orders".parse::<RequestClass>(), Ok(RequestClass::Orders));
        assert_eq!("Products".parse::<RequestClass>(), Ok(RequestClass::Products));
        assert_eq!(" inventory ".parse::<RequestClass>(), Ok(RequestClass::Inventory));
        assert_eq!("default".parse::<RequestClass>(), Ok(RequestClass::Default));
    }

    #[test]
    fn test_unknown_class_falls_back_to_default() {
        assert!("shipments".parse::<RequestClass>().is_err());
        assert_eq!(RequestClass::from_name("shipments"), RequestClass::Default);
    }

    #[test]
    fn test_display_matches_serde_name() {
        for class in RequestClass::ALL {
            let yaml = serde_yaml::to_string(&class).unwrap();
            assert_eq!(yaml.trim(), class.to_string());
        }
    }

    #[test]
    fn test_global_limit_defaults_to_multiple_of_base() {
        let limit = ClassLimit::per_minute(60);
        assert_eq!(limit.global_per_minute(), 600);

        let limit = ClassLimit {
            global_requests_per_minute: Some(600),
            ..ClassLimit::per_minute(60)
        };
        assert_eq!(limit.global_per_minute(), 600);

        let limit = ClassLimit {
            global_requests_per_minute: Some(30),
            ..ClassLimit::per_minute(60)
        };
        assert_eq!(limit.global_per_minute(), 30);
    }
}
