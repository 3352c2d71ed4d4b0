/// Wake-word model invocation
///
/// A model is a function from a fixed-length window of PCM samples to a score
/// in [0.0, 1.0]. Models are registered by name through a [`ModelProvider`]
/// and handed to sessions wrapped in a [`ModelInvoker`], which enforces the
/// input contract and runs the (blocking) inference off the async runtime.
///
/// Concurrency contract: every model instance sits behind a mutex, so calls
/// into one instance are serialised. With `reset_state_per_session` each
/// session loads its own instance and sessions never contend; without it one
/// instance per model is shared by every session.

use crate::audio::AudioSample;
use crate::config::DetectorConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Model used when neither the operator nor the client picks one
pub const DEFAULT_MODEL: &str = "energy";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid input shape for model {model}: expected {expected}, got {actual}")]
    InvalidInputShape {
        model: String,
        expected: String,
        actual: String,
    },

    #[error("Model returned invalid score: {0}")]
    InvalidScore(f32),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Failed to load model: {0}")]
    Load(String),
}

/// Static description of a model's input contract and metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelDescriptor {
    /// Wake word identifier reported in detections
    pub name: String,

    /// Human-readable phrase
    pub phrase: String,

    pub sample_rate: u32,

    /// Samples per scoring call
    pub window_length: usize,

    pub languages: Vec<String>,

    pub version: String,

    /// Attribution reported in `info`
    pub author: String,
    pub website: String,
}

/// A loaded model instance.
///
/// Any recurrent state lives inside the implementation and is never
/// inspected from outside.
pub trait WakeWordModel: Send {
    /// Score one window. `window.len()` always equals the descriptor's
    /// `window_length`.
    fn score(&mut self, window: &[AudioSample]) -> Result<f32, ModelError>;
}

/// Factory for model instances
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn descriptor(&self) -> &ModelDescriptor;

    async fn load(&self) -> Result<Box<dyn WakeWordModel>, ModelError>;
}

type SharedModel = Arc<Mutex<Box<dyn WakeWordModel>>>;

/// Session-side handle to one model
#[derive(Clone)]
pub struct ModelInvoker {
    descriptor: Arc<ModelDescriptor>,
    model: SharedModel,
}

impl ModelInvoker {
    fn new(descriptor: Arc<ModelDescriptor>, model: SharedModel) -> Self {
        Self { descriptor, model }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn wake_word_id(&self) -> &str {
        &self.descriptor.name
    }

    /// Score a window.
    ///
    /// Inference runs on the blocking pool; this await is the session's
    /// suspension point.
    pub async fn score(&self, window: Vec<AudioSample>) -> Result<f32, ModelError> {
        if window.len() != self.descriptor.window_length {
            return Err(ModelError::InvalidInputShape {
                model: self.descriptor.name.clone(),
                expected: format!("{} samples", self.descriptor.window_length),
                actual: format!("{} samples", window.len()),
            });
        }

        let model = Arc::clone(&self.model);
        let score = tokio::task::spawn_blocking(move || model.blocking_lock().score(&window))
            .await
            .map_err(|e| ModelError::Inference(format!("Scoring task failed: {}", e)))??;

        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(ModelError::InvalidScore(score));
        }

        Ok(score)
    }
}

/// Registered models, keyed by name
pub struct ModelRegistry {
    providers: BTreeMap<String, Arc<dyn ModelProvider>>,
    shared: Mutex<HashMap<String, SharedModel>>,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
            shared: Mutex::new(HashMap::new()),
        }
    }

    /// Registry holding the built-in models, shaped for `config`
    pub fn with_builtin(config: &DetectorConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EnergyModelProvider::new(
            config.sample_rate,
            config.window_length,
        )));
        registry
    }

    /// Built-in models plus every model found in `config.custom_model_dirs`
    pub fn from_config(config: &DetectorConfig) -> Self {
        let mut registry = Self::with_builtin(config);
        let found = registry.register_model_dirs(&config.custom_model_dirs, config);
        if found > 0 {
            info!("Registered {} custom wake-word model(s)", found);
        }
        registry
    }

    /// Register the ONNX models found in `dirs`, returning how many
    pub fn register_model_dirs(&mut self, dirs: &[PathBuf], config: &DetectorConfig) -> usize {
        let providers = crate::onnx::discover_models(dirs, config);
        let count = providers.len();
        for provider in providers {
            self.register(Arc::new(provider));
        }
        count
    }

    /// Register a provider, replacing any provider with the same name
    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        let name = provider.descriptor().name.clone();
        debug!("Registering model: {}", name);
        self.providers.insert(name, provider);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.providers.values().map(|p| p.descriptor())
    }

    /// Check every model against the configured window contract.
    ///
    /// A mismatch here is a configuration error and should abort startup.
    pub fn validate(&self, config: &DetectorConfig) -> Result<(), ModelError> {
        for descriptor in self.descriptors() {
            if descriptor.sample_rate != config.sample_rate {
                return Err(ModelError::InvalidInputShape {
                    model: descriptor.name.clone(),
                    expected: format!("{} Hz", config.sample_rate),
                    actual: format!("{} Hz", descriptor.sample_rate),
                });
            }

            if descriptor.window_length != config.window_length {
                return Err(ModelError::InvalidInputShape {
                    model: descriptor.name.clone(),
                    expected: format!("{} samples", config.window_length),
                    actual: format!("{} samples", descriptor.window_length),
                });
            }
        }

        Ok(())
    }

    /// Get an invoker for `name`.
    ///
    /// `isolated` loads a fresh instance; otherwise the shared instance is
    /// loaded once and reused.
    pub async fn invoker(&self, name: &str, isolated: bool) -> Result<ModelInvoker, ModelError> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))?;
        let descriptor = Arc::new(provider.descriptor().clone());

        if isolated {
            let model = provider.load().await?;
            return Ok(ModelInvoker::new(descriptor, Arc::new(Mutex::new(model))));
        }

        let mut shared = self.shared.lock().await;
        let model = match shared.get(name) {
            Some(model) => Arc::clone(model),
            None => {
                info!("Loading shared model: {}", name);
                let model: SharedModel = Arc::new(Mutex::new(provider.load().await?));
                shared.insert(name.to_string(), Arc::clone(&model));
                model
            }
        };

        Ok(ModelInvoker::new(descriptor, model))
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Loudness model.
///
/// Scores a window by its RMS level relative to a reference level. It knows
/// nothing about phrases; it exists so the service can be exercised end to
/// end without a trained network.
pub struct EnergyModel {
    reference_rms: f32,
}

impl EnergyModel {
    pub fn new(reference_rms: f32) -> Self {
        Self { reference_rms }
    }

    fn calculate_rms(samples: &[AudioSample]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }

        let sum_squares: f64 = samples
            .iter()
            .map(|&s| {
                let normalized = s as f64 / i16::MAX as f64;
                normalized * normalized
            })
            .sum();

        (sum_squares / samples.len() as f64).sqrt()
    }
}

impl WakeWordModel for EnergyModel {
    fn score(&mut self, window: &[AudioSample]) -> Result<f32, ModelError> {
        let rms = Self::calculate_rms(window) as f32;
        Ok((rms / self.reference_rms).clamp(0.0, 1.0))
    }
}

/// Provider for [`EnergyModel`]
pub struct EnergyModelProvider {
    descriptor: ModelDescriptor,
    reference_rms: f32,
}

impl EnergyModelProvider {
    pub fn new(sample_rate: u32, window_length: usize) -> Self {
        Self {
            descriptor: ModelDescriptor {
                name: DEFAULT_MODEL.to_string(),
                phrase: "Loud sound".to_string(),
                sample_rate,
                window_length,
                languages: Vec::new(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                author: "AetherOS Team".to_string(),
                website: String::new(),
            },
            reference_rms: 0.25,
        }
    }
}

#[async_trait]
impl ModelProvider for EnergyModelProvider {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    async fn load(&self) -> Result<Box<dyn WakeWordModel>, ModelError> {
        Ok(Box::new(EnergyModel::new(self.reference_rms)))
    }
}
