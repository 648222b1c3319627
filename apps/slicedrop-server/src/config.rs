//! Daemon configuration.
//!
//! Stored as TOML at `$SLICEDROP_CONFIG` when set, otherwise:
//! - Linux: `~/.config/slicedrop/server.toml`
//! - Windows: `%APPDATA%/slicedrop/server.toml`
//!
//! A default file is written on first run.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "SLICEDROP_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Shared root holding staging directories and merged artifacts.
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,

    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// WebSocket port (0 = OS-assigned).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL under which `upload_root` is served; artifact locations are
    /// reported as `{public_url}/{file}`. Unset reports filesystem paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// Re-fingerprint merged artifacts and reject mismatches.
    #[serde(default = "default_true")]
    pub verify_merge: bool,
}

fn default_upload_root() -> PathBuf {
    data_dir().join("uploads")
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9060
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
            host: default_host(),
            port: default_port(),
            public_url: None,
            verify_merge: default_true(),
        }
    }
}

impl Config {
    /// Loads configuration, writing the default file if none exists.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("slicedrop").join("server.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("slicedrop")
            .join("server.toml")
    }
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let local =
            std::env::var("LOCALAPPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData\\Local".into());
        PathBuf::from(local).join("slicedrop")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".local").join("share").join("slicedrop")
    }
}
