//! Configuration management for eqmon.
//!
//! Loads config from YAML files in standard locations. Command-line flags
//! and the `DETECT_AREA` environment variable are applied on top through
//! [`Overrides`].

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::scale::{Scale, ScaleError};

const PRODUCTION_URL: &str = "wss://api.p2pquake.net/v2/ws";
const SANDBOX_URL: &str = "wss://api-realtime-sandbox.p2pquake.net/v2/ws";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No feed URL configured for the {0} environment")]
    MissingFeedUrl(&'static str),

    #[error("Invalid notify.silent: {0}")]
    InvalidSilent(#[from] ScaleError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FeedEnv {
    #[default]
    Sandbox,
    Prod,
}

impl FeedEnv {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Sandbox => "Sandbox",
            Self::Prod => "Production",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub env: FeedEnv,
    pub production_url: String,
    pub sandbox_url: String,
    pub quiet: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            env: FeedEnv::Sandbox,
            production_url: PRODUCTION_URL.into(),
            sandbox_url: SANDBOX_URL.into(),
            quiet: false,
        }
    }
}

impl FeedConfig {
    pub fn url(&self) -> Result<&str, ConfigError> {
        let url = match self.env {
            FeedEnv::Prod => &self.production_url,
            FeedEnv::Sandbox => &self.sandbox_url,
        };
        if url.trim().is_empty() {
            return Err(ConfigError::MissingFeedUrl(self.env.display_name()));
        }
        Ok(url)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Intensity sign at or below which nothing is played.
    pub silent: Option<String>,
    /// Areas watched for user-sensed evaluations, in priority order.
    pub detect_areas: Vec<String>,
}

impl NotifyConfig {
    pub fn silent_scale(&self) -> Result<Option<Scale>, ConfigError> {
        Ok(self.silent.as_deref().map(Scale::from_sign).transpose()?)
    }

    /// Replace the watched areas with a comma-separated list.
    pub fn set_detect_areas(&mut self, list: &str) {
        self.detect_areas = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub engine_url: String,
    pub speaker: u32,
    pub cache_dir: PathBuf,
    pub request_timeout_secs: Option<u64>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            engine_url: "http://localhost:50021".into(),
            speaker: 1,
            cache_dir: PathBuf::from("/tmp"),
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub command: String,
    pub sounds_dir: PathBuf,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            command: "aplay".into(),
            sounds_dir: PathBuf::from("wav"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub enabled: bool,
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub notify: NotifyConfig,
    pub voice: VoiceConfig,
    pub player: PlayerConfig,
    pub store: StoreConfig,
}

/// Values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub env: Option<FeedEnv>,
    pub silent: Option<Scale>,
    pub quiet: bool,
    /// Comma-separated list, as read from `DETECT_AREA`.
    pub detect_areas: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub no_store: bool,
}

impl Config {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(env) = overrides.env {
            self.feed.env = env;
        }
        if overrides.quiet {
            self.feed.quiet = true;
        }
        if let Some(scale) = overrides.silent {
            self.notify.silent = Some(scale.sign().to_string());
        }
        if let Some(areas) = overrides.detect_areas {
            self.notify.set_detect_areas(&areas);
        }
        if let Some(dir) = overrides.data_dir {
            self.store.data_dir = dir;
        }
        if overrides.no_store {
            self.store.enabled = false;
        }
    }

    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/eqmon/config.yaml
    /// 3. /etc/eqmon/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/eqmon/config.yaml")),
                Some(PathBuf::from("/etc/eqmon/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
