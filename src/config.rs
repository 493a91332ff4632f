//! TOML configuration.
//!
//! Everything the orchestrator and the workers need is read once into a
//! [`Config`] and passed explicitly at construction. Nothing is read from
//! global state after startup except the upstream credential, which lives in
//! the environment variable named by [`UpstreamConfig::credentials_env`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Base address of the upstream REST API, e.g. `https://host/api`.
    pub base_url: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_credentials_env")]
    pub credentials_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_credentials_env() -> String {
    "ELEVATION_BRIDGE_TOKEN".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_job_timeout_secs() -> u64 {
    300
}
fn default_session_timeout_secs() -> u64 {
    3_600
}

impl SyncConfig {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, …
    /// capped at `backoff_max_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    let base = config.upstream.base_url.as_str();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        anyhow::bail!("upstream.base_url must be an http(s) URL, got '{}'", base);
    }
    if config.upstream.request_timeout_secs == 0 {
        anyhow::bail!("upstream.request_timeout_secs must be > 0");
    }

    let sync = &config.sync;
    if sync.workers == 0 {
        anyhow::bail!("sync.workers must be >= 1");
    }
    if sync.backoff_base_ms > sync.backoff_max_ms {
        anyhow::bail!(
            "sync.backoff_base_ms ({}) must not exceed sync.backoff_max_ms ({})",
            sync.backoff_base_ms,
            sync.backoff_max_ms
        );
    }
    if sync.job_timeout_secs == 0 || sync.session_timeout_secs == 0 {
        anyhow::bail!("sync.job_timeout_secs and sync.session_timeout_secs must be > 0");
    }

    Ok(())
}
