/// Detector configuration
///
/// Operator-facing knobs for windowing, thresholding and debounce. Loaded from
/// defaults, an optional JSON file and environment overrides, then validated
/// once at startup.

use crate::audio::{AudioFormat, SAMPLE_RATE};
use crate::audio_buffer::BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// What to do when a session's ring buffer overruns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Log and keep detecting on the freshest data
    #[default]
    Advisory,

    /// Terminate the session
    Fatal,
}

/// Configuration for wake-word detection sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Score at or above which a window counts as a hit (0.0 - 1.0)
    pub threshold: f32,

    /// Consecutive hits needed to trigger
    pub required_consecutive_hits: u32,

    /// Windows ignored after a trigger
    pub refractory_window_count: u32,

    /// Samples the window advances between scoring calls
    pub stride: usize,

    /// Samples per scored window
    pub window_length: usize,

    /// Load a fresh model instance for every session
    pub reset_state_per_session: bool,

    /// Ring buffer capacity in samples
    pub buffer_capacity: usize,

    pub overrun_policy: OverrunPolicy,

    /// Sample rate the models expect
    pub sample_rate: u32,

    /// Chunks queued per session before the reader applies backpressure
    pub queue_depth: usize,

    /// Wake words used when a client does not pick any
    pub default_models: Vec<String>,

    /// Directories scanned for ONNX wake-word configs, earliest first
    pub custom_model_dirs: Vec<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            required_consecutive_hits: 1,
            refractory_window_count: 40, // 2s at the default stride
            stride: 800,                 // 50ms at 16kHz
            window_length: 1600,         // 100ms at 16kHz
            reset_state_per_session: true,
            buffer_capacity: BUFFER_SIZE,
            overrun_policy: OverrunPolicy::Advisory,
            sample_rate: SAMPLE_RATE,
            queue_depth: 64,
            default_models: vec![crate::model::DEFAULT_MODEL.to_string()],
            custom_model_dirs: Vec::new(),
        }
    }
}

impl DetectorConfig {
    /// Load configuration from a JSON file (missing fields keep defaults)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading detector config from {}", path.display());

        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;

        Ok(config)
    }

    /// Apply `WAKEWORD_*` environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(threshold) = env_var::<f32>("WAKEWORD_THRESHOLD")? {
            self.threshold = threshold;
        }

        if let Some(hits) = env_var::<u32>("WAKEWORD_REQUIRED_HITS")? {
            self.required_consecutive_hits = hits;
        }

        if let Some(seconds) = env_var::<f32>("WAKEWORD_REFRACTORY_SECONDS")? {
            self.set_refractory_seconds(seconds);
        }

        Ok(())
    }

    /// Express the refractory period in seconds of audio
    pub fn set_refractory_seconds(&mut self, seconds: f32) {
        let samples = seconds.max(0.0) as f64 * self.sample_rate as f64;
        self.refractory_window_count = (samples / self.stride.max(1) as f64).ceil() as u32;
    }

    /// Format every session must declare
    pub fn required_format(&self) -> AudioFormat {
        AudioFormat::mono_pcm16(self.sample_rate)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Invalid(
                "threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.required_consecutive_hits == 0 {
            return Err(ConfigError::Invalid(
                "required_consecutive_hits must be at least 1".to_string(),
            ));
        }

        if self.stride == 0 {
            return Err(ConfigError::Invalid("stride must be greater than 0".to_string()));
        }

        if self.window_length == 0 {
            return Err(ConfigError::Invalid(
                "window_length must be greater than 0".to_string(),
            ));
        }

        if self.buffer_capacity < self.window_length {
            return Err(ConfigError::Invalid(format!(
                "buffer_capacity ({}) must be at least window_length ({})",
                self.buffer_capacity, self.window_length
            )));
        }

        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "sample_rate must be greater than 0".to_string(),
            ));
        }

        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "queue_depth must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.required_format(), AudioFormat::mono_pcm16(16000));
    }

    #[test]
    fn test_config_validation() {
        let mut config = DetectorConfig::default();

        config.threshold = 1.5;
        assert!(config.validate().is_err());
        config.threshold = 0.5;

        config.required_consecutive_hits = 0;
        assert!(config.validate().is_err());
        config.required_consecutive_hits = 1;

        config.stride = 0;
        assert!(config.validate().is_err());
        config.stride = 800;

        config.buffer_capacity = config.window_length - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refractory_seconds_conversion() {
        let mut config = DetectorConfig::default();
        config.set_refractory_seconds(2.0);
        assert_eq!(config.refractory_window_count, 40);

        config.set_refractory_seconds(0.06);
        assert_eq!(config.refractory_window_count, 2);

        config.set_refractory_seconds(0.0);
        assert_eq!(config.refractory_window_count, 0);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"threshold": 0.7, "required_consecutive_hits": 3, "overrun_policy": "fatal"}}"#
        )
        .unwrap();

        let config = DetectorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.threshold, 0.7);
        assert_eq!(config.required_consecutive_hits, 3);
        assert_eq!(config.overrun_policy, OverrunPolicy::Fatal);
        assert_eq!(config.window_length, 1600);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"window_length": 5000, "buffer_capacity": 100}}"#).unwrap();

        assert!(matches!(
            DetectorConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            DetectorConfig::from_file("/nonexistent/wakeword.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
