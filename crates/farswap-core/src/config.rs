//! Daemon configuration.
//!
//! Every field defaults to the compile-time value the daemon ships with, so an
//! empty file (or no file) yields a working configuration:
//!
//! ```toml
//! [session]
//! max_clients = 32
//! ack_timeout_ms = 10000
//!
//! [pool]
//! max_chunks = 32
//! chunk_size = "1G"
//!
//! [monitor]
//! evict_threshold_gb = 8
//! expand_threshold_gb = 16
//! free_mem_weight = 0.7
//! ```

use crate::units::{parse_size, ONE_GB};
use crate::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

/// Default system-wide configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/farswap.toml";

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Connection and handshake limits.
    pub session: SessionConfig,
    /// Chunk pool sizing.
    pub pool: PoolConfig,
    /// Eviction/expansion monitor tuning.
    pub monitor: MonitorConfig,
}

/// Connection limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Maximum concurrent connections.
    pub max_clients: usize,
    /// Bounded wait for EVICT/STOP acknowledgements, in milliseconds.
    pub ack_timeout_ms: u64,
    /// How long a dispatcher blocks on the transport before re-checking
    /// connection liveness, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_clients: 32,
            ack_timeout_ms: 10_000,
            poll_interval_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Acknowledgement timeout.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Dispatcher poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Chunk pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Hard maximum number of chunks offered.
    pub max_chunks: usize,
    /// Advertised capacity at startup; defaults to `max_chunks`.
    pub initial_chunks: Option<usize>,
    /// Slots per control message and per connection.
    pub max_entries: usize,
    /// Bytes per chunk.
    #[serde(deserialize_with = "deserialize_size")]
    pub chunk_size: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_chunks: 32,
            initial_chunks: None,
            max_entries: 32,
            chunk_size: ONE_GB,
        }
    }
}

impl PoolConfig {
    /// Advertised capacity at startup.
    #[must_use]
    pub fn initial_capacity(&self) -> usize {
        self.initial_chunks.unwrap_or(self.max_chunks)
    }
}

/// Eviction/expansion monitor tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Evict when smoothed free memory drops below this many GB.
    pub evict_threshold_gb: u64,
    /// Expand when smoothed free memory rises above this many GB.
    pub expand_threshold_gb: u64,
    /// Consecutive low samples before evicting.
    pub evict_hit_threshold: u32,
    /// Consecutive high samples before expanding.
    pub expand_hit_threshold: u32,
    /// Weight of the running average in the EMA.
    pub free_mem_weight: f64,
    /// Sampling period in milliseconds.
    pub sample_interval_ms: u64,
    /// Chunks added to capacity per expansion.
    pub expand_step: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            evict_threshold_gb: 8,
            expand_threshold_gb: 16,
            evict_hit_threshold: 1,
            expand_hit_threshold: 20,
            free_mem_weight: 0.7,
            sample_interval_ms: 1000,
            expand_step: 1,
        }
    }
}

impl MonitorConfig {
    /// Sampling period.
    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Config {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on syntax errors or unknown keys.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Load configuration from `path`, or from [`DEFAULT_CONFIG_PATH`] when
    /// it exists, or fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file cannot be read or any
    /// file fails to parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Check cross-field constraints.
    ///
    /// `page_size` is the host page size; chunks must be a multiple of it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first violation.
    pub fn validate(&self, page_size: u64) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.session.max_clients == 0 {
            return invalid("session.max_clients must be non-zero".to_string());
        }
        if self.pool.max_chunks == 0 {
            return invalid("pool.max_chunks must be non-zero".to_string());
        }
        if self.pool.max_entries == 0 || u32::try_from(self.pool.max_entries).is_err() {
            return invalid(format!(
                "pool.max_entries must be in 1..=u32::MAX, got {}",
                self.pool.max_entries
            ));
        }
        if self.pool.initial_capacity() > self.pool.max_chunks {
            return invalid(format!(
                "pool.initial_chunks ({}) exceeds pool.max_chunks ({})",
                self.pool.initial_capacity(),
                self.pool.max_chunks
            ));
        }
        if self.pool.chunk_size == 0 || page_size == 0 || self.pool.chunk_size % page_size != 0 {
            return invalid(format!(
                "pool.chunk_size ({}) must be a non-zero multiple of the page size ({page_size})",
                self.pool.chunk_size
            ));
        }
        if usize::try_from(self.pool.chunk_size).is_err() {
            return invalid("pool.chunk_size does not fit the address space".to_string());
        }
        let w = self.monitor.free_mem_weight;
        if !(0.0..1.0).contains(&w) {
            return invalid(format!("monitor.free_mem_weight must be in [0, 1), got {w}"));
        }
        if self.monitor.evict_threshold_gb >= self.monitor.expand_threshold_gb {
            return invalid(format!(
                "monitor.evict_threshold_gb ({}) must be below monitor.expand_threshold_gb ({})",
                self.monitor.evict_threshold_gb, self.monitor.expand_threshold_gb
            ));
        }
        if self.monitor.evict_hit_threshold == 0 || self.monitor.expand_hit_threshold == 0 {
            return invalid("monitor hit thresholds must be non-zero".to_string());
        }
        if self.monitor.expand_step == 0 {
            return invalid("monitor.expand_step must be non-zero".to_string());
        }
        Ok(())
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.max_clients, 32);
        assert_eq!(config.pool.max_chunks, 32);
        assert_eq!(config.pool.max_entries, 32);
        assert_eq!(config.pool.chunk_size, ONE_GB);
        assert_eq!(config.pool.initial_capacity(), 32);
        assert_eq!(config.monitor.evict_threshold_gb, 8);
        assert_eq!(config.monitor.expand_threshold_gb, 16);
        assert_eq!(config.monitor.evict_hit_threshold, 1);
        assert_eq!(config.monitor.expand_hit_threshold, 20);
        assert!((config.monitor.free_mem_weight - 0.7).abs() < f64::EPSILON);
        assert!(config.validate(PAGE).is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [session]
            max_clients = 4

            [pool]
            max_chunks = 8
            initial_chunks = 2
            chunk_size = "64M"

            [monitor]
            evict_threshold_gb = 2
            expand_threshold_gb = 4
            free_mem_weight = 0.5
        "#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.session.max_clients, 4);
        assert_eq!(config.session.ack_timeout_ms, 10_000);
        assert_eq!(config.pool.max_chunks, 8);
        assert_eq!(config.pool.initial_capacity(), 2);
        assert_eq!(config.pool.chunk_size, 64 << 20);
        assert_eq!(config.monitor.evict_hit_threshold, 1);
        assert!(config.validate(PAGE).is_ok());
    }

    #[test]
    fn test_chunk_size_as_integer() {
        let config = Config::from_toml("[pool]\nchunk_size = 65536\n").unwrap();
        assert_eq!(config.pool.chunk_size, 65536);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::from_toml("[pool]\nmax_gigs = 3\n").is_err());
    }

    #[test]
    fn test_validate_initial_exceeds_max() {
        let mut config = Config::default();
        config.pool.initial_chunks = Some(33);
        assert!(config.validate(PAGE).is_err());
    }

    #[test]
    fn test_validate_weight_range() {
        let mut config = Config::default();
        config.monitor.free_mem_weight = 1.0;
        assert!(config.validate(PAGE).is_err());
        config.monitor.free_mem_weight = 0.0;
        assert!(config.validate(PAGE).is_ok());
    }

    #[test]
    fn test_validate_thresholds_ordered() {
        let mut config = Config::default();
        config.monitor.evict_threshold_gb = 16;
        assert!(config.validate(PAGE).is_err());
    }

    #[test]
    fn test_validate_chunk_size_page_multiple() {
        let mut config = Config::default();
        config.pool.chunk_size = PAGE + 1;
        assert!(config.validate(PAGE).is_err());
        config.pool.chunk_size = 16 * PAGE;
        assert!(config.validate(PAGE).is_ok());
    }

    #[test]
    fn test_validate_zero_clients() {
        let mut config = Config::default();
        config.session.max_clients = 0;
        let err = config.validate(PAGE).unwrap_err();
        assert!(err.to_string().contains("max_clients"));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let result = Config::load(Some(Path::new("/nonexistent/farswap.toml")));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.session.ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.monitor.sample_interval(), Duration::from_secs(1));
    }
}
