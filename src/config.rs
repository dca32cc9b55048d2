//! Configuration file parser for `blogroll.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file (`:memory:` for a throwaway database).
    pub database_path: PathBuf,
    pub sync: SyncConfig,
    pub fetch: FetchConfig,
    pub database: DatabaseConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minutes between scheduler passes.
    pub interval_minutes: u64,
    /// Run one pass immediately when the scheduler starts.
    pub run_on_startup: bool,
    /// Upper bound on blogs synced at the same time.
    pub max_concurrent: usize,
    /// Blogs synced more recently than this are skipped by scheduled passes.
    pub resync_after_minutes: u64,
    /// Upper bound on page fetches for posts whose feed entry has no content.
    pub page_fetch_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Retries for 429 / 5xx / truncated responses.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub retry_base_delay_ms: u64,
    /// Accept feed URLs on localhost and private networks.
    pub allow_private_hosts: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Upper bound on any single database operation.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_tags_per_article: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("blogroll.db"),
            sync: SyncConfig::default(),
            fetch: FetchConfig::default(),
            database: DatabaseConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            run_on_startup: true,
            max_concurrent: 8,
            resync_after_minutes: 60,
            page_fetch_concurrency: 4,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!(
                "blogroll/{} (+https://github.com/blogroll/blogroll)",
                env!("CARGO_PKG_VERSION")
            ),
            max_retries: 3,
            retry_base_delay_ms: 2000,
            allow_private_hosts: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { timeout_secs: 3 }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_tags_per_article: 3,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn resync_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.resync_after_minutes as i64)
    }

    /// `interval` as a wall-clock duration, for comparing with timestamps.
    pub fn interval_chrono(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.interval_minutes as i64)
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl DatabaseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = ["database_path", "sync", "fetch", "database", "search"];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    /// - Unknown top-level keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            database = %config.database_path.display(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                key: "sync.interval_minutes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sync.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "sync.max_concurrent",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sync.page_fetch_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "sync.page_fetch_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "fetch.timeout_secs",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.database.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "database.timeout_secs",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
