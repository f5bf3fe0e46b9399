//! Orchestrator configuration.
//!
//! Stored as TOML at `$OTAFETCH_CONFIG`, or `~/.config/otafetch/otafetch.toml`
//! when the variable is unset.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use otafetch_protocol::MAX_BLOCK_SIZE;
use otafetch_protocol::constants::REQUEST_TIMEOUT;
use otafetch_transport::Credentials;
use serde::{Deserialize, Serialize};

use crate::retry::ReconnectConfig;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "OTAFETCH_CONFIG";

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source URL, possibly carrying a time-limited grant.
    #[serde(default)]
    pub url: Option<String>,

    /// File holding the current source URL. Re-read whenever the grant
    /// expires; takes precedence over `url`.
    #[serde(default)]
    pub url_file: Option<PathBuf>,

    /// Image size in bytes, as stated by the update job.
    pub file_size: u64,

    /// Where the assembled image is written.
    #[serde(default = "default_output")]
    pub output: PathBuf,

    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Buffers shared with the engine.
    #[serde(default = "default_pool_slots")]
    pub pool_slots: usize,

    /// PEM root CA replacing the built-in roots.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// PEM client certificate for mutual TLS.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,

    /// PEM private key for `client_cert`.
    #[serde(default)]
    pub client_key: Option<PathBuf>,

    /// Hex SHA-256 the assembled image must match.
    #[serde(default)]
    pub expected_sha256: Option<String>,

    /// Transfer restarts allowed without progress before giving up.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// How long one block request may stay outstanding before the transfer
    /// is restarted. The engine bounds the head and the body separately by
    /// its request timeout, so keep this above twice that.
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_output() -> PathBuf {
    PathBuf::from("firmware.bin")
}

fn default_block_size() -> u32 {
    MAX_BLOCK_SIZE
}

fn default_pool_slots() -> usize {
    8
}

fn default_max_restarts() -> u32 {
    5
}

fn default_block_timeout_ms() -> u64 {
    2 * REQUEST_TIMEOUT.as_millis() as u64 + 15_000
}

impl Config {
    /// Loads and validates the configuration from its default location.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_none() && self.url_file.is_none() {
            bail!("one of `url` or `url_file` must be set");
        }
        if self.file_size == 0 {
            bail!("`file_size` must be positive");
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            bail!("`block_size` must be within 1..={MAX_BLOCK_SIZE}");
        }
        if self.pool_slots == 0 {
            bail!("`pool_slots` must be positive");
        }
        if self.client_cert.is_some() != self.client_key.is_some() {
            bail!("`client_cert` and `client_key` must be given together");
        }
        Ok(())
    }

    /// Current source locator. Reads `url_file` afresh on every call.
    pub fn locator(&self) -> anyhow::Result<String> {
        if let Some(path) = &self.url_file {
            let url = std::fs::read_to_string(path)
                .with_context(|| format!("reading locator from {}", path.display()))?;
            let url = url.trim();
            if url.is_empty() {
                bail!("{} is empty", path.display());
            }
            return Ok(url.to_string());
        }
        self.url
            .clone()
            .context("no source locator configured")
    }

    /// Whether a fresh grant can be fetched after expiry.
    pub fn can_renew(&self) -> bool {
        self.url_file.is_some()
    }

    /// Loads the configured trust material.
    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        let read = |path: &Option<PathBuf>| -> anyhow::Result<Option<Vec<u8>>> {
            path.as_ref()
                .map(|p| std::fs::read(p).with_context(|| format!("reading {}", p.display())))
                .transpose()
        };
        Ok(Credentials {
            root_ca_pem: read(&self.ca_cert)?,
            client_cert_pem: read(&self.client_cert)?,
            client_key_pem: read(&self.client_key)?,
        })
    }
}

/// Returns the configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("otafetch")
        .join("otafetch.toml")
}
