use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ParleyError, Result};

/// Environment variables consulted, in order, when `session.api_key` is unset.
pub const API_KEY_ENV_VARS: [&str; 2] = ["PARLEY_API_KEY", "API_KEY"];

const fn default_block_size() -> usize {
    4096
}

const fn default_send_queue_depth() -> usize {
    32
}

const fn default_event_queue_depth() -> usize {
    256
}

fn default_endpoint() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_model() -> String {
    "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string()
}

fn default_voice() -> String {
    "Kore".to_string()
}

fn default_system_instruction() -> String {
    "You are Smart StudyMate, a helpful, patient, and encouraging AI tutor. \
     Help the student understand concepts step-by-step. Keep answers concise and clear."
        .to_string()
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_close_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input_device: Option<String>,

    pub output_device: Option<String>,

    /// Samples per capture block at 16 kHz.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,

    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            block_size: default_block_size(),
            send_queue_depth: default_send_queue_depth(),
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,

    pub api_key: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

impl SessionConfig {
    /// The configured API key, falling back to the environment.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                API_KEY_ENV_VARS
                    .iter()
                    .find_map(|var| std::env::var(var).ok().filter(|k| !k.is_empty()))
            })
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ParleyError::Config(format!(
                "config file not found: {}; create it or use --config to specify a path",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            ParleyError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            ParleyError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.block_size == 0 {
            return Err(ParleyError::Config(
                "audio.block_size must be greater than zero".to_string(),
            ));
        }
        if self.audio.send_queue_depth == 0 || self.audio.event_queue_depth == 0 {
            return Err(ParleyError::Config(
                "audio queue depths must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("parley/config.yaml")
    }
}
