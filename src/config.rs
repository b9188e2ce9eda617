//! Application configuration.
//!
//! Loaded from TOML (default `~/.clashlink/config.toml`). Every section is
//! optional; a missing file yields the built-in defaults. A few settings can
//! be overridden from the environment for container deployments.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::clash::GenerationOptions;

/// Env override for [`StorageConfig::subscriptions_dir`].
pub const ENV_SUBSCRIPTIONS_DIR: &str = "CLASHLINK_SUBSCRIPTIONS_DIR";

/// Env override for [`GatewayConfig::port`].
pub const ENV_PORT: &str = "CLASHLINK_PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    /// Defaults for options a generate request leaves out.
    pub generation: GenerationOptions,
    /// File this config was read from; `None` for built-in defaults.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            generation: GenerationOptions::default(),
            source: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Base URL for subscription links, e.g. `https://subs.example.com`.
    /// When unset, links are built from the request `Host` header.
    pub public_url: Option<String>,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            public_url: None,
            request_timeout_secs: 30,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub subscriptions_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            subscriptions_dir: state_dir().join("subscriptions"),
        }
    }
}

/// `~/.clashlink`, or `./.clashlink` when no home directory is known.
pub fn state_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clashlink")
}

/// Default config file location: `~/.clashlink/config.toml`.
pub fn default_config_path() -> PathBuf {
    state_dir().join("config.toml")
}

impl AppConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// tried and skipped when absent; [`AppConfig::source`] records which
    /// file, if any, was used. Environment overrides are applied last, then
    /// the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.generation = config.generation.normalized();
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (`std::env::var` in
    /// production, a map in tests).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_SUBSCRIPTIONS_DIR).filter(|d| !d.trim().is_empty()) {
            self.storage.subscriptions_dir = PathBuf::from(dir.trim());
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.gateway.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a port number, got '{port}'"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            bail!("gateway.port must be between 1 and 65535");
        }
        if self.gateway.request_timeout_secs == 0 {
            bail!("gateway.request_timeout_secs must be greater than zero");
        }
        if self.gateway.max_body_bytes == 0 {
            bail!("gateway.max_body_bytes must be greater than zero");
        }
        if let Some(url) = &self.gateway.public_url {
            url::Url::parse(url)
                .with_context(|| format!("gateway.public_url is not a valid URL: {url}"))?;
        }
        Ok(())
    }

    /// `host:port` the gateway binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}
