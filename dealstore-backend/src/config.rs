use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dealstore_common::layout::AUTO_LAYOUT;

pub const BYPASS_INIT_CHECK_ENV: &str = "DEALSTORE_BYPASS_INIT_CHECK";
pub const TOKEN_ENV: &str = "DEALSTORE_TOKEN";

const DEFAULT_CONNECTIONS: usize = 5;
const DEFAULT_TEST_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_BATCH_MAX_ENTRIES: usize = 256;
const DEFAULT_BATCH_MAX_BYTES: u64 = 64 * 1024 * 1024; // 64 MiB
const DEFAULT_BATCH_MAX_AGE_MS: u64 = 5_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Session token presented to both remote services.
    #[serde(default)]
    pub token: String,
    /// Deal-submission API endpoint (`host:port`).
    pub server_addr: String,
    /// Content-store gateway endpoint (`host:port`).
    pub gateway_addr: String,
    #[serde(default = "default_layout")]
    pub layout: String,
    /// Repository namespace root inside the shared storage account.
    pub backup_root: String,
    /// Upper bound on simultaneous remote calls.
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,
    /// Parent directory for local staging trees. Defaults to the system temp dir.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub bypass_init_check: bool,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_batch_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_batch_max_age_ms")]
    pub max_age_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_BATCH_MAX_ENTRIES,
            max_bytes: DEFAULT_BATCH_MAX_BYTES,
            max_age_ms: DEFAULT_BATCH_MAX_AGE_MS,
        }
    }
}

impl BatchConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

fn default_layout() -> String {
    AUTO_LAYOUT.to_string()
}

fn default_connections() -> usize {
    DEFAULT_CONNECTIONS
}

fn default_test_timeout_ms() -> u64 {
    DEFAULT_TEST_TIMEOUT_MS
}

fn default_batch_max_entries() -> usize {
    DEFAULT_BATCH_MAX_ENTRIES
}

fn default_batch_max_bytes() -> u64 {
    DEFAULT_BATCH_MAX_BYTES
}

fn default_batch_max_age_ms() -> u64 {
    DEFAULT_BATCH_MAX_AGE_MS
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply process-environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.is_empty()) {
            self.token = token;
        }
        if lookup(BYPASS_INIT_CHECK_ENV).is_some_and(|v| !v.is_empty()) {
            self.bypass_init_check = true;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token.is_empty() {
            anyhow::bail!("token must not be empty (set it in the config or {})", TOKEN_ENV);
        }
        for (name, addr) in [("server_addr", &self.server_addr), ("gateway_addr", &self.gateway_addr)] {
            if addr.is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }
        if !self.backup_root.starts_with('/') || self.backup_root.trim_matches('/').is_empty() {
            anyhow::bail!("backup_root must be an absolute, non-root path: {:?}", self.backup_root);
        }
        if self.connections == 0 {
            anyhow::bail!("connections must be at least 1");
        }
        if self.test_timeout_ms == 0 {
            anyhow::bail!("test_timeout_ms must be positive");
        }
        if self.batch.max_entries == 0 || self.batch.max_bytes == 0 || self.batch.max_age_ms == 0 {
            anyhow::bail!("batch thresholds must all be positive");
        }
        Ok(())
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }
}
