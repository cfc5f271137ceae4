use std::fs;
use std::path::Path;
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::audio::activity::DEFAULT_ACTIVITY_THRESHOLD;
use crate::audio::error::AudioError;

pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 16000;
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24000;
pub const DEFAULT_FRAME_SIZE: usize = 4096;
pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Everything a session needs, fixed when the session starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub capture_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub activity_threshold: f32,
    pub endpoint: String,
    pub model: String,
    /// Never written back out
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub voice_name: Option<String>,
    /// Capture device name, system default when unset
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: DEFAULT_CAPTURE_SAMPLE_RATE,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            activity_threshold: DEFAULT_ACTIVITY_THRESHOLD,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            voice_name: None,
            input_device: None,
            output_device: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), AudioError> {
        if !(8000..=192000).contains(&self.capture_sample_rate) {
            return Err(AudioError::invalid_config("capture_sample_rate", "must be between 8000 and 192000 Hz"));
        }
        if !(8000..=192000).contains(&self.output_sample_rate) {
            return Err(AudioError::invalid_config("output_sample_rate", "must be between 8000 and 192000 Hz"));
        }
        if self.frame_size == 0 {
            return Err(AudioError::invalid_config("frame_size", "must be greater than zero"));
        }
        if !self.activity_threshold.is_finite() || !(0.0..1.0).contains(&self.activity_threshold) {
            return Err(AudioError::invalid_config("activity_threshold", "must be in [0, 1)"));
        }
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(AudioError::invalid_config("endpoint", "must be a ws:// or wss:// URL"));
        }
        if self.model.trim().is_empty() {
            return Err(AudioError::invalid_config("model", "must not be empty"));
        }
        Ok(())
    }

    /// Read a JSON config file, or fall back to defaults when `path` is None.
    /// Missing fields take their default values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config: SessionConfig = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?;
                info!("Loaded session config from {}", path.display());
                config
            }
            None => SessionConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }
}
