//! Configuration for the resource caches

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable for the table idle timeout, in seconds
pub const ENV_TABLE_IDLE_SECS: &str = "TABLECACHE_TABLE_IDLE_SECS";
/// Environment variable for the reader idle timeout, in seconds
pub const ENV_READER_IDLE_SECS: &str = "TABLECACHE_READER_IDLE_SECS";
/// Environment variable for the background sweep interval, in seconds
pub const ENV_CLEANUP_INTERVAL_SECS: &str = "TABLECACHE_CLEANUP_INTERVAL_SECS";
/// Environment variable toggling the background sweep (`true`/`false`)
pub const ENV_AUTO_CLEANUP: &str = "TABLECACHE_AUTO_CLEANUP";

const TEN_MINUTES: Duration = Duration::from_secs(10 * 60);

/// Configuration shared by every instance cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tables not accessed for this long are released
    pub table_idle_timeout: Duration,

    /// Readers not accessed for this long are released
    pub reader_idle_timeout: Duration,

    /// Run a background task that sweeps idle entries
    pub enable_auto_cleanup: bool,

    /// Interval between background sweeps
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            table_idle_timeout: TEN_MINUTES,
            reader_idle_timeout: TEN_MINUTES,
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.table_idle_timeout.is_zero() {
            return Err(CacheError::Config(
                "table_idle_timeout must be greater than 0".to_string(),
            ));
        }

        if self.reader_idle_timeout.is_zero() {
            return Err(CacheError::Config(
                "reader_idle_timeout must be greater than 0".to_string(),
            ));
        }

        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(CacheError::Config(
                "cleanup_interval must be greater than 0 when auto cleanup is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from the process environment.
    ///
    /// A `.env` file in the working directory is read first if present.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(secs) = parse_secs(&lookup, ENV_TABLE_IDLE_SECS)? {
            builder = builder.table_idle_timeout(secs);
        }
        if let Some(secs) = parse_secs(&lookup, ENV_READER_IDLE_SECS)? {
            builder = builder.reader_idle_timeout(secs);
        }
        if let Some(secs) = parse_secs(&lookup, ENV_CLEANUP_INTERVAL_SECS)? {
            builder = builder.cleanup_interval(secs);
        }
        if let Some(raw) = lookup(ENV_AUTO_CLEANUP) {
            let enable = raw.trim().parse::<bool>().map_err(|_| {
                CacheError::Config(format!("{} must be true or false, got '{}'", ENV_AUTO_CLEANUP, raw))
            })?;
            builder = builder.enable_auto_cleanup(enable);
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| {
                CacheError::Config(format!("{} must be a number of seconds, got '{}'", key, raw))
            }),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    table_idle_timeout: Option<Duration>,
    reader_idle_timeout: Option<Duration>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Set the idle timeout for tables
    pub fn table_idle_timeout(mut self, timeout: Duration) -> Self {
        self.table_idle_timeout = Some(timeout);
        self
    }

    /// Set the idle timeout for readers
    pub fn reader_idle_timeout(mut self, timeout: Duration) -> Self {
        self.reader_idle_timeout = Some(timeout);
        self
    }

    /// Set both idle timeouts at once
    pub fn idle_timeout(self, timeout: Duration) -> Self {
        self.table_idle_timeout(timeout).reader_idle_timeout(timeout)
    }

    /// Enable or disable the background sweep
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set the background sweep interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            table_idle_timeout: self
                .table_idle_timeout
                .unwrap_or(defaults.table_idle_timeout),
            reader_idle_timeout: self
                .reader_idle_timeout
                .unwrap_or(defaults.reader_idle_timeout),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }
}

/// Preset configurations
impl CacheConfig {
    /// Short idle windows for instances with many rarely used tables
    pub fn aggressive() -> Self {
        Self {
            table_idle_timeout: Duration::from_secs(60),
            reader_idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(15),
            ..Default::default()
        }
    }

    /// Long idle windows for a small, hot working set
    pub fn long_lived() -> Self {
        Self {
            table_idle_timeout: Duration::from_secs(3600),
            reader_idle_timeout: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            ..Default::default()
        }
    }
}
