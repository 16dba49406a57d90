//! Configuration loading and types.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Each subsection governs one storage-core concern:
//! the file store's base directory, the metadata catalog, secret-at-rest
//! crypto, garbage collection defaults, migration defaults, and logging.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// File store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Secret-at-rest crypto settings.
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Garbage collector defaults.
    #[serde(default)]
    pub gc: GcConfig,

    /// Migration engine defaults.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Geo-stats service settings.
    #[serde(default)]
    pub geo_stats: GeoStatsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// File store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for stored objects. Must be absolute at runtime.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root_dir: default_storage_root() }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Path to the SQLite database file, or `:memory:`.
    #[serde(default = "default_metadata_path")]
    pub path: String,

    /// Size of the pooled read connections (§4.D: "≈ 10").
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
            read_pool_size: default_read_pool_size(),
        }
    }
}

/// Secret-at-rest crypto configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CryptoConfig {
    /// Reserved for future key-rotation configuration. The key itself is
    /// always stored under the `system.encryption_key` setting, never in
    /// this file.
    #[serde(default)]
    pub _reserved: (),
}

/// Garbage collector defaults, overridable per invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct GcConfig {
    /// Default multipart upload max age before expiry, in seconds.
    #[serde(default = "default_max_upload_age_secs")]
    pub max_upload_age_secs: i64,

    /// Whether scheduled GC runs dry-run by default.
    #[serde(default)]
    pub dry_run_default: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_upload_age_secs: default_max_upload_age_secs(),
            dry_run_default: false,
        }
    }
}

/// Migration engine defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MigrationConfig {
    /// Default AWS region presented to the source client when the job
    /// config omits one.
    #[serde(default = "default_region")]
    pub default_region: String,
}

/// Geo-stats service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoStatsConfig {
    /// `realtime` or `batch`.
    #[serde(default = "default_geo_stats_mode")]
    pub mode: String,

    /// Buffer size that triggers a flush in batch mode.
    #[serde(default = "default_geo_stats_batch_size")]
    pub batch_size: usize,

    /// Ticker interval (seconds) that flushes regardless of buffer size.
    #[serde(default = "default_geo_stats_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for GeoStatsConfig {
    fn default() -> Self {
        Self {
            mode: default_geo_stats_mode(),
            batch_size: default_geo_stats_batch_size(),
            flush_interval_secs: default_geo_stats_flush_interval_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_metadata_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_read_pool_size() -> usize {
    10
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_max_upload_age_secs() -> i64 {
    24 * 3600
}

fn default_geo_stats_mode() -> String {
    "batch".to_string()
}

fn default_geo_stats_batch_size() -> usize {
    100
}

fn default_geo_stats_flush_interval_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config {
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            crypto: CryptoConfig::default(),
            gc: GcConfig::default(),
            migration: MigrationConfig::default(),
            geo_stats: GeoStatsConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert_eq!(config.metadata.read_pool_size, 10);
        assert_eq!(config.migration.default_region, "us-east-1");
        assert_eq!(config.geo_stats.mode, "batch");
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = "storage:\n  root_dir: /data/objects\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.root_dir, "/data/objects");
        assert_eq!(config.metadata.path, "./data/metadata.db");
    }
}
