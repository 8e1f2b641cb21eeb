//! Configuration management for the Comzy client.
//!
//! Handles loading and saving configuration from the platform config
//! directory (`config.toml`). The stored token is the only credential the
//! client keeps; without it the tunnel runs in anonymous mode.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::TunnelError;

pub const DEFAULT_RELAY_URL: &str = "wss://api.comzy.io:8191";
pub const DEFAULT_RELAY_DOMAIN: &str = "comzy.io";
pub const LOGIN_URL: &str = "https://portal.comzy.io";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    pub url: Option<String>,
    pub domain: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        restrict_permissions(path)
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "comzy").ok_or_else(|| {
            TunnelError::FatalConfiguration("Could not determine config directory".to_string())
        })?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// The stored token, if any. Blank tokens count as none.
    pub fn token(&self) -> Option<&str> {
        self.auth
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn relay_domain(&self) -> &str {
        self.relay.domain.as_deref().unwrap_or(DEFAULT_RELAY_DOMAIN)
    }

    /// Resolve the relay URL: `cli` (flag or env) wins over the config file.
    pub fn relay_url(&self, cli: Option<&str>) -> Result<String> {
        let raw = cli
            .or(self.relay.url.as_deref())
            .unwrap_or(DEFAULT_RELAY_URL);

        validate_relay_url(raw)?;
        Ok(raw.to_string())
    }
}

fn validate_relay_url(raw: &str) -> std::result::Result<(), TunnelError> {
    let url = Url::parse(raw)
        .map_err(|e| TunnelError::FatalConfiguration(format!("Invalid relay URL {}: {}", raw, e)))?;

    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(TunnelError::FatalConfiguration(format!(
            "Relay URL must use ws:// or wss://, got {}://",
            other
        ))),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
