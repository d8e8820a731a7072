//! `devpair` configuration.
//!
//! Loaded from `~/.devpair/config.toml` (or an explicit path), then
//! overridden from the environment. A missing file means defaults. The
//! Sheets access token is only ever read from the environment.
//!
//! ```toml
//! [pairing]
//! ttl_secs = 300
//! poll_interval_ms = 3000
//! max_consecutive_failures = 5
//!
//! [retry]
//! max_attempts = 4
//! base_delay_ms = 250
//! max_delay_ms = 5000
//! quota_delay_ms = 15000
//!
//! [store]
//! backend = "sheets"
//! quota_per_minute = 100
//! spreadsheet_id = "1AbC..."
//! sheet = "Pairing"
//! ```

use crate::pairing::poller::{PollBudget, PollerConfig};
use crate::store::sheets::DEFAULT_API_BASE;
use crate::store::throttle::DEFAULT_QUOTA_PER_MINUTE;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the Sheets OAuth access token.
pub const ENV_SHEETS_TOKEN: &str = "DEVPAIR_SHEETS_TOKEN";
/// Environment override for `store.spreadsheet_id`.
pub const ENV_SPREADSHEET_ID: &str = "DEVPAIR_SPREADSHEET_ID";
/// Environment override for `store.sheet`.
pub const ENV_SHEET: &str = "DEVPAIR_SHEET";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pairing: PairingConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    /// Populated from [`ENV_SHEETS_TOKEN`]; never read from or written to disk.
    #[serde(skip)]
    pub sheets_token: Option<String>,
}

/// Session lifetime and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub ttl_secs: u64,
    pub poll_interval_ms: u64,
    pub max_consecutive_failures: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            poll_interval_ms: 3_000,
            max_consecutive_failures: 5,
        }
    }
}

impl PairingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: self.poll_interval(),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

/// Backoff for store calls made by create and verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub quota_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            quota_delay_ms: 15_000,
        }
    }
}

/// Which row store adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// SQLite file shared by processes on this host.
    #[default]
    Sqlite,
    /// Remote spreadsheet over the values API.
    Sheets,
    /// Process-local table; only useful for a single-process demo.
    Memory,
}

/// Row store location and quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Shared per-minute budget; 0 disables local throttling.
    pub quota_per_minute: u32,
    /// SQLite file; defaults to `~/.devpair/rows.db`.
    pub sqlite_path: Option<PathBuf>,
    pub spreadsheet_id: Option<String>,
    pub sheet: String,
    pub api_base: String,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            quota_per_minute: DEFAULT_QUOTA_PER_MINUTE,
            sqlite_path: None,
            spreadsheet_id: None,
            sheet: "Pairing".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout_secs: 30,
        }
    }
}

/// `~/.devpair`, if a home directory can be found.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    use directories::UserDirs;

    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".devpair"))
}

/// `~/.devpair/config.toml`.
pub fn default_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

impl Config {
    /// Load from `path` (or the default path), apply environment overrides
    /// and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_path()?,
        };
        let mut config = Self::from_file(&path)?;
        config.apply_overrides_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file; a missing file yields defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(token) = non_empty(ENV_SHEETS_TOKEN) {
            self.sheets_token = Some(token);
        }
        if let Some(id) = non_empty(ENV_SPREADSHEET_ID) {
            self.store.spreadsheet_id = Some(id);
        }
        if let Some(sheet) = non_empty(ENV_SHEET) {
            self.store.sheet = sheet;
        }
    }

    /// Reject settings that cannot produce a working pairing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pairing.ttl_secs == 0 {
            anyhow::bail!("pairing.ttl_secs must be positive");
        }
        if self.pairing.poll_interval_ms == 0 {
            anyhow::bail!("pairing.poll_interval_ms must be positive");
        }
        if self.pairing.poll_interval() >= self.pairing.ttl() {
            anyhow::bail!(
                "pairing.poll_interval_ms ({}) must be shorter than the session lifetime ({}s)",
                self.pairing.poll_interval_ms,
                self.pairing.ttl_secs
            );
        }
        if self.pairing.max_consecutive_failures == 0 {
            anyhow::bail!("pairing.max_consecutive_failures must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.store.sheet.trim().is_empty() {
            anyhow::bail!("store.sheet must not be empty");
        }
        PollBudget::check(
            self.pairing.ttl(),
            self.pairing.poll_interval(),
            self.store.quota_per_minute,
        )
        .context("Poll interval does not fit the store quota")?;
        Ok(())
    }

    /// SQLite file location, defaulting to `~/.devpair/rows.db`.
    pub fn sqlite_path(&self) -> anyhow::Result<PathBuf> {
        match &self.store.sqlite_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("rows.db")),
        }
    }
}
