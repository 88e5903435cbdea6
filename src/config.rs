//! Configuration types
//!
//! All components are configured through [`GovernorConfig`], built from
//! defaults, an optional TOML file, and `APIGOV_`-prefixed environment
//! variables (nested fields separated by `__`, e.g. `APIGOV_POOL__SIZE=8`).

use crate::error::{Error, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the governance layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Cache settings
    pub cache: CacheConfig,
    /// Rate governor settings
    pub rate: RateConfig,
    /// Client pool settings
    pub pool: PoolConfig,
    /// Bulk dispatcher settings
    pub bulk: BulkConfig,
}

impl GovernorConfig {
    /// Load configuration from defaults, an optional TOML file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("APIGOV_").split("__"))
            .extract()
            .map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.rate.validate()?;
        self.pool.validate()?;
        self.bulk.validate()
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled; when disabled, fetches always go upstream
    pub enabled: bool,
    /// TTL applied to categories without an explicit entry below
    pub default_ttl_seconds: u64,
    /// Maximum number of entries before size-based eviction kicks in
    pub max_entries: u64,
    /// Interval of the background sweep that removes expired entries
    pub sweep_interval_seconds: u64,
    /// Per-category TTL overrides, e.g. `{"chat_info": 600, "messages": 120}`
    pub categories: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_seconds: 300,
            max_entries: 10_000,
            sweep_interval_seconds: 60,
            categories: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::config("cache.max_entries must be greater than 0"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(Error::config(
                "cache.sweep_interval_seconds must be greater than 0",
            ));
        }
        Ok(())
    }

    /// TTL for a category, falling back to the default TTL
    pub fn ttl_for(&self, category: &str) -> Duration {
        let seconds = self
            .categories
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl_seconds);
        Duration::from_secs(seconds)
    }

    /// Sweep interval as a [`Duration`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// A single token bucket definition
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum burst size in tokens
    pub capacity: f64,
    /// Refill rate in tokens per second
    pub refill_per_second: f64,
}

impl BucketConfig {
    /// Bucket allowing `per_second` sustained operations with an equal burst
    pub fn per_second(per_second: f64) -> Self {
        Self {
            capacity: per_second,
            refill_per_second: per_second,
        }
    }
}

/// Rate governor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Pre-declared category buckets
    pub categories: HashMap<String, BucketConfig>,
    /// Bucket used for categories that were never configured
    pub fallback: BucketConfig,
}

impl Default for RateConfig {
    fn default() -> Self {
        let mut categories = HashMap::new();
        categories.insert("read".to_string(), BucketConfig::per_second(30.0));
        categories.insert("write".to_string(), BucketConfig::per_second(10.0));
        categories.insert("media".to_string(), BucketConfig::per_second(5.0));
        categories.insert("admin".to_string(), BucketConfig::per_second(5.0));
        Self {
            categories,
            fallback: BucketConfig::per_second(20.0),
        }
    }
}

impl RateConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        for (category, bucket) in self
            .categories
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(std::iter::once(("fallback", &self.fallback)))
        {
            if bucket.capacity < 1.0 {
                return Err(Error::config(format!(
                    "rate bucket '{category}': capacity must be at least 1"
                )));
            }
            if bucket.refill_per_second <= 0.0 {
                return Err(Error::config(format!(
                    "rate bucket '{category}': refill_per_second must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Client pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of clients to create at startup
    pub size: usize,
    /// Startup fails unless at least this many clients could be created
    pub min_clients: usize,
    /// Default acquisition timeout
    pub acquire_timeout_seconds: u64,
    /// How long shutdown waits for outstanding leases before force-closing
    pub shutdown_grace_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            min_clients: 1,
            acquire_timeout_seconds: 10,
            shutdown_grace_seconds: 30,
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::config("pool.size must be greater than 0"));
        }
        if self.min_clients > self.size {
            return Err(Error::config("pool.min_clients cannot exceed pool.size"));
        }
        Ok(())
    }

    /// Default acquisition timeout as a [`Duration`]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    /// Shutdown grace period as a [`Duration`]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Bulk dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Retry budget for transient per-item failures
    pub max_retries: u32,
    /// Per-item deadline covering permit wait, client wait and the call itself
    pub item_timeout_seconds: u64,
    /// Concurrent in-flight items; 0 means "pool size"
    pub max_concurrency: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            item_timeout_seconds: 30,
            max_concurrency: 0,
        }
    }
}

impl BulkConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.item_timeout_seconds == 0 {
            return Err(Error::config(
                "bulk.item_timeout_seconds must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Per-item timeout as a [`Duration`]
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_seconds)
    }
}
