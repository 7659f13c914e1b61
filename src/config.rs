//! Allocator configuration
//!
//! Settings can be built programmatically, loaded from a serde document, or read
//! from the environment:
//!
//! - `DEVCACHE_MEMCACHE`: `0`, `false`, `off` or `no` disables buffer caching
//! - `DEVCACHE_ON_CONSISTENCY`: `report` (default) or `abort`
//! - `DEVCACHE_DEVICE`: device used by threads that never selected one

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::{DevCacheError, DevCacheResult};

/// Environment variable toggling the free-buffer cache
pub const MEMCACHE_ENV: &str = "DEVCACHE_MEMCACHE";

/// Environment variable selecting the consistency policy
pub const CONSISTENCY_ENV: &str = "DEVCACHE_ON_CONSISTENCY";

/// Environment variable for the default device
pub const DEVICE_ENV: &str = "DEVCACHE_DEVICE";

/// What the allocator does when its contract is violated
/// (double free, unknown pointer, wrong residency)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyPolicy {
    /// Log at error level and return the typed error
    #[default]
    Report,
    /// Log at error level, then abort the process
    Abort,
}

impl ConsistencyPolicy {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "report" | "error" | "return" => Some(ConsistencyPolicy::Report),
            "abort" | "panic" | "fatal" => Some(ConsistencyPolicy::Abort),
            _ => None,
        }
    }
}

/// Caching allocator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep released device buffers for reuse instead of freeing them
    pub caching: bool,
    /// Reaction to contract violations
    pub consistency: ConsistencyPolicy,
    /// Device for threads that never selected one
    pub default_device: DeviceId,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            caching: true,
            consistency: ConsistencyPolicy::Report,
            default_device: 0,
        }
    }
}

impl CacheConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable buffer caching
    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    /// Set the consistency policy
    pub fn with_consistency(mut self, consistency: ConsistencyPolicy) -> Self {
        self.consistency = consistency;
        self
    }

    /// Set the default device
    pub fn with_default_device(mut self, device: DeviceId) -> Self {
        self.default_device = device;
        self
    }

    /// Build a configuration from environment variables, falling back to defaults
    ///
    /// Unparseable values are rejected rather than ignored.
    pub fn from_env() -> DevCacheResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(MEMCACHE_ENV) {
            config.caching = parse_switch(&value).ok_or_else(|| {
                DevCacheError::InvalidConfiguration(format!("{}={}", MEMCACHE_ENV, value))
            })?;
        }

        if let Ok(value) = std::env::var(CONSISTENCY_ENV) {
            config.consistency = ConsistencyPolicy::from_str(&value).ok_or_else(|| {
                DevCacheError::InvalidConfiguration(format!("{}={}", CONSISTENCY_ENV, value))
            })?;
        }

        if let Ok(value) = std::env::var(DEVICE_ENV) {
            config.default_device = value.trim().parse().map_err(|_| {
                DevCacheError::InvalidConfiguration(format!("{}={}", DEVICE_ENV, value))
            })?;
        }

        Ok(config)
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
