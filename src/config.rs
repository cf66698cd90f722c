//! Cache configuration
//!
//! ```toml
//! max_entries = 32
//! max_file_size = 1048576
//! retention_secs = 10
//! eviction_probability = 0.05
//! bloom_bits = 131072
//! bloom_depth = 4
//! ```
//!
//! Missing keys take their defaults.

use crate::charset::Charset;
use crate::error::{Result, TevdError};
use crate::integrity::{ChecksumMismatch, CrcLevel, WarningSink};
use crate::partial::PartialDom;
use crate::skimmer::DiskSkimmer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_ENTRIES: usize = 16;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_RETENTION_SECS: u64 = 5;
pub const DEFAULT_EVICTION_PROBABILITY: f64 = 0.1;
pub const DEFAULT_BLOOM_BITS: usize = 65_536;
pub const DEFAULT_BLOOM_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Most entries held in the cache at once
    pub max_entries: usize,
    /// Files with more content than this are never cached
    pub max_file_size: u64,
    /// Idle time after which the worst entry is always evicted
    pub retention_secs: u64,
    /// Chance of evicting the worst entry before it has gone stale
    pub eviction_probability: f64,
    pub bloom_bits: usize,
    pub bloom_depth: usize,
    /// Fixed seed for the eviction RNG
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            retention_secs: DEFAULT_RETENTION_SECS,
            eviction_probability: DEFAULT_EVICTION_PROBABILITY,
            bloom_bits: DEFAULT_BLOOM_BITS,
            bloom_depth: DEFAULT_BLOOM_DEPTH,
            seed: None,
        }
    }
}

impl CacheConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(TevdError::InvalidOperation(
                "max_entries must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.eviction_probability) {
            return Err(TevdError::InvalidOperation(format!(
                "eviction_probability {} is outside 0..=1",
                self.eviction_probability
            )));
        }
        if self.bloom_bits < 2 || self.bloom_depth == 0 {
            return Err(TevdError::InvalidOperation(format!(
                "bloom filter needs at least 2 bits and 1 hash (got {} bits, depth {})",
                self.bloom_bits, self.bloom_depth
            )));
        }
        Ok(())
    }
}

/// Builder for opening a [`PartialDom`]
///
/// ```rust,no_run
/// use tevd::{Charset, PartialDomBuilder};
///
/// # fn main() -> tevd::Result<()> {
/// let dom = PartialDomBuilder::new("disk.tevd")
///     .max_entries(64)
///     .eviction_probability(0.05)
///     .open(Charset::Utf8)?;
/// # Ok(())
/// # }
/// ```
pub struct PartialDomBuilder {
    path: PathBuf,
    config: CacheConfig,
    crc_level: CrcLevel,
    on_warn: Option<WarningSink>,
}

impl PartialDomBuilder {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        PartialDomBuilder {
            path: path.into(),
            config: CacheConfig::default(),
            crc_level: CrcLevel::default(),
            on_warn: None,
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.config.max_entries = max_entries;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.max_file_size = bytes;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention_secs = retention.as_secs();
        self
    }

    pub fn eviction_probability(mut self, probability: f64) -> Self {
        self.config.eviction_probability = probability;
        self
    }

    pub fn bloom(mut self, bits: usize, depth: usize) -> Self {
        self.config.bloom_bits = bits;
        self.config.bloom_depth = depth;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn crc_level(mut self, level: CrcLevel) -> Self {
        self.crc_level = level;
        self
    }

    /// Receive checksum mismatches found while reading at [`CrcLevel::Warn`]
    pub fn on_checksum_warning<F>(mut self, on_warn: F) -> Self
    where
        F: FnMut(&ChecksumMismatch) + Send + 'static,
    {
        self.on_warn = Some(Box::new(on_warn));
        self
    }

    pub fn open(self, charset: Charset) -> Result<PartialDom> {
        let skimmer = match self.on_warn {
            Some(on_warn) => DiskSkimmer::open_with_callback(&self.path, self.crc_level, on_warn)?,
            None => DiskSkimmer::open_with_level(&self.path, self.crc_level)?,
        };
        PartialDom::from_skimmer(skimmer, self.config, charset)
    }
}
