// src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::Prefetch;

const CONFIG_FILE: &str = "rabbit-channel.json";

/// Settings applied when opening a channel with
/// [`Channel::open_with_config`](crate::channel::Channel::open_with_config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Caller label, the last part of the channel identity.
    #[serde(default = "default_label")]
    pub label: String,

    /// Number of unacknowledged deliveries allowed (0 means unlimited)
    #[serde(default)]
    pub prefetch_count: u16,

    #[serde(default)]
    pub prefetch_size: u32,

    /// Apply the prefetch to the whole channel rather than per consumer.
    #[serde(default)]
    pub global_prefetch: bool,
}

fn default_label() -> String {
    "channel".to_string()
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            prefetch_count: 0,
            prefetch_size: 0,
            global_prefetch: false,
        }
    }
}

impl ChannelConfig {
    /// The prefetch window to apply at open, if any limit is configured.
    pub fn prefetch(&self) -> Option<Prefetch> {
        if self.prefetch_count == 0 && self.prefetch_size == 0 {
            return None;
        }
        Some(Prefetch {
            count: self.prefetch_count,
            size: self.prefetch_size,
        })
    }

    /// Read settings from the environment (and `.env` when present), falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();
        Ok(Self {
            label: env::var("RABBIT_CHANNEL_LABEL").unwrap_or(defaults.label),
            prefetch_count: parse_var("RABBIT_PREFETCH_COUNT")?.unwrap_or(defaults.prefetch_count),
            prefetch_size: parse_var("RABBIT_PREFETCH_SIZE")?.unwrap_or(defaults.prefetch_size),
            global_prefetch: parse_var("RABBIT_GLOBAL_PREFETCH")?
                .unwrap_or(defaults.global_prefetch),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file at {}", path.display()))?;
        let config: ChannelConfig = serde_json::from_str(&content)
            .context("Configuration file contains invalid JSON")?;

        if config.label.is_empty() {
            return Err(anyhow!("Configuration error: label cannot be empty"));
        }
        debug!(path = %path.display(), label = %config.label, "Loaded channel config");
        Ok(config)
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .context(format!("Invalid value for {}: {:?}", name, value)),
        Err(_) => Ok(None),
    }
}

/// Look for a config file in the working directory, `config/`, then the
/// user's home directory.
pub fn find_config_file() -> Option<PathBuf> {
    let candidates = [
        PathBuf::from(CONFIG_FILE),
        Path::new("config").join(CONFIG_FILE),
    ];
    for path in candidates {
        if path.exists() {
            debug!("Found config file: {}", path.display());
            return Some(path);
        }
    }

    let home_config = home::home_dir()?.join(format!(".{}", CONFIG_FILE));
    home_config.exists().then_some(home_config)
}
