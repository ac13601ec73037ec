//! Router and cache configuration
//!
//! Both structs deserialize from TOML with every field optional:
//!
//! ```toml
//! name = "edge-proxy"
//! resolution = "exact"
//! exchange_idle_timeout_ms = 10000
//!
//! [cache]
//! capacity = 2000
//! sweep_interval_secs = 30
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, RouterError};

/// How the deliverer maps a URI path onto the resource tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathResolution {
    /// Stop at the deepest resource whose name matched; later segments are
    /// handed to it as a sub-path
    #[default]
    DeepestMatch,
    /// Every segment must name a child
    Exact,
}

/// Proxy cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Start with caching enabled
    pub enabled: bool,
    /// Maximum number of stored variants
    pub capacity: usize,
    /// Hard residency bound, independent of Max-Age
    pub max_residency_secs: u64,
    /// Lifetime assumed when a response has no Max-Age
    pub default_max_age: u32,
    /// Upper bound for any stored lifetime
    pub max_age_cap: u32,
    /// Payloads above this size are not stored
    pub max_payload_bytes: usize,
    /// Period of the background residency sweep; `None` disables it
    pub sweep_interval_secs: Option<u64>,
    /// Mount the `debug/cache` admin resource
    pub admin_resource: bool,
}

impl CacheConfig {
    pub fn max_residency(&self) -> Duration {
        Duration::from_secs(self.max_residency_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
            max_residency_secs: 60 * 60 * 24,
            default_max_age: coapflow_core::DEFAULT_MAX_AGE,
            max_age_cap: 60 * 60 * 24,
            max_payload_bytes: 1024 * 1024,
            sweep_interval_secs: None,
            admin_resource: true,
        }
    }
}

/// Router configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Server name, used in log lines
    pub name: String,
    /// Path resolution mode
    pub resolution: PathResolution,
    /// Idle time before the pipeline retires a non-observing exchange queue
    pub exchange_idle_timeout_ms: u64,
    /// Proxy cache settings
    pub cache: CacheConfig,
}

impl RouterConfig {
    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| RouterError::Config(e.to_string()))
    }

    pub fn exchange_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_idle_timeout_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "coapflow".to_string(),
            resolution: PathResolution::default(),
            exchange_idle_timeout_ms: 30_000,
            cache: CacheConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.resolution, PathResolution::DeepestMatch);
        assert_eq!(config.cache.capacity, 10_000);
        assert_eq!(config.cache.max_residency(), Duration::from_secs(86_400));
        assert_eq!(config.cache.default_max_age, 60);
        assert!(config.cache.sweep_interval().is_none());
        assert_eq!(config.exchange_idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_toml() {
        let config = RouterConfig::from_toml_str(
            r#"
            name = "edge"
            resolution = "exact"
            exchange_idle_timeout_ms = 500

            [cache]
            capacity = 5
            sweep_interval_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "edge");
        assert_eq!(config.resolution, PathResolution::Exact);
        assert_eq!(config.exchange_idle_timeout(), Duration::from_millis(500));
        assert_eq!(config.cache.capacity, 5);
        assert_eq!(config.cache.sweep_interval(), Some(Duration::from_secs(30)));
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        let err = RouterConfig::from_toml_str("resolution = \"sideways\"").unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
    }
}
