use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Constraints requested when opening the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Tuning for the local speaking detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    pub fft_size: usize,
    pub smoothing: f32,
    /// Mean byte-frequency energy (0-255) that must be exceeded
    pub threshold: f32,
    pub interval_ms: u64,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.8,
            threshold: 15.0,
            interval_ms: 100,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STUN server URLs, one ICE server entry each
    pub ice_servers: Vec<String>,
    pub audio: AudioConstraints,
    pub speaking: SpeakingConfig,
    /// Input device name, `None` for the system default
    pub input_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_owned(),
                "stun:stun1.l.google.com:19302".to_owned(),
            ],
            audio: AudioConstraints::default(),
            speaking: SpeakingConfig::default(),
            input_device: None,
        }
    }
}

/// Default location of the config file
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voxroom")
        .join("session.json")
}

impl SessionConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults on any error
    pub fn load_or_default() -> Self {
        let path = config_path();
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ice_servers.is_empty() {
            return Err(ConfigError::Invalid("at least one ICE server is required".into()));
        }
        if let Some(url) = self
            .ice_servers
            .iter()
            .find(|u| !u.starts_with("stun:") && !u.starts_with("stuns:"))
        {
            return Err(ConfigError::Invalid(format!(
                "only STUN servers are supported, got '{}'",
                url
            )));
        }

        let speaking = &self.speaking;
        if !speaking.fft_size.is_power_of_two() || speaking.fft_size < 32 {
            return Err(ConfigError::Invalid(format!(
                "fft_size must be a power of two >= 32, got {}",
                speaking.fft_size
            )));
        }
        if !(0.0..1.0).contains(&speaking.smoothing) {
            return Err(ConfigError::Invalid(format!(
                "smoothing must be in [0, 1), got {}",
                speaking.smoothing
            )));
        }
        if speaking.min_decibels >= speaking.max_decibels {
            return Err(ConfigError::Invalid("min_decibels must be below max_decibels".into()));
        }
        if speaking.interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be positive".into()));
        }
        Ok(())
    }
}
