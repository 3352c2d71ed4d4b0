/// ONNX wake-word models loaded from model directories
///
/// A model directory holds one JSON config per wake word next to its ONNX
/// file; the config's file stem is the wake word id. The network takes one
/// window of normalised PCM as a `[1, window_length]` float tensor and
/// returns the wake-word probability as the first element of its first
/// output.

use crate::audio::AudioSample;
use crate::config::DetectorConfig;
use crate::model::{ModelDescriptor, ModelError, ModelProvider, WakeWordModel};
use async_trait::async_trait;
use ndarray::Array2;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Config `type` handled by this loader
pub const MODEL_TYPE: &str = "onnx";

/// Per-model JSON config
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfigFile {
    #[serde(rename = "type", default)]
    pub model_type: String,

    /// Phrase reported in `info`
    pub wake_word: String,

    /// Model file, relative to the config's directory
    pub model: PathBuf,

    #[serde(default)]
    pub author: String,

    #[serde(default)]
    pub website: String,

    #[serde(default)]
    pub trained_languages: Vec<String>,

    /// Number or string
    #[serde(default)]
    pub version: Option<Value>,

    /// Overrides the configured sample rate
    #[serde(default)]
    pub sample_rate: Option<u32>,

    /// Overrides the configured window length
    #[serde(default)]
    pub window_length: Option<usize>,
}

impl ModelConfigFile {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ModelError::Load(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| ModelError::Load(format!("{}: {}", path.display(), e)))
    }

    fn version_string(&self) -> String {
        match &self.version {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(version)) => version.clone(),
            Some(other) => other.to_string(),
        }
    }
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> ModelError {
    ModelError::Load(format!("{}: {}", path.display(), e))
}

/// A loaded ONNX classifier
pub struct OnnxModel {
    session: Session,
}

impl OnnxModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let session = Session::builder()
            .map_err(|e| load_error(path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(path, e))?
            .with_intra_threads(1)
            .map_err(|e| load_error(path, e))?
            .with_inter_threads(1)
            .map_err(|e| load_error(path, e))?
            .commit_from_file(path)
            .map_err(|e| load_error(path, e))?;

        Ok(Self { session })
    }
}

impl WakeWordModel for OnnxModel {
    fn score(&mut self, window: &[AudioSample]) -> Result<f32, ModelError> {
        let normalized: Vec<f32> = window.iter().map(|&s| s as f32 / 32767.0).collect();
        let input = Array2::from_shape_vec((1, window.len()), normalized)
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let tensor = Tensor::from_array(input).map_err(|e| ModelError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .map_err(|e| ModelError::Inference(format!("Failed to extract output: {}", e)))?;

        output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| ModelError::Inference("Model produced an empty output".to_string()))
    }
}

/// Provider for one model found on disk
pub struct OnnxModelProvider {
    descriptor: ModelDescriptor,
    model_path: PathBuf,
}

impl OnnxModelProvider {
    pub fn new(name: String, file: &ModelConfigFile, model_path: PathBuf, config: &DetectorConfig) -> Self {
        Self {
            descriptor: ModelDescriptor {
                name,
                phrase: file.wake_word.clone(),
                sample_rate: file.sample_rate.unwrap_or(config.sample_rate),
                window_length: file.window_length.unwrap_or(config.window_length),
                languages: file.trained_languages.clone(),
                version: file.version_string(),
                author: file.author.clone(),
                website: file.website.clone(),
            },
            model_path,
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

#[async_trait]
impl ModelProvider for OnnxModelProvider {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    async fn load(&self) -> Result<Box<dyn WakeWordModel>, ModelError> {
        debug!("Loading ONNX model: {}", self.model_path.display());

        let path = self.model_path.clone();
        let model = tokio::task::spawn_blocking(move || OnnxModel::load(&path))
            .await
            .map_err(|e| ModelError::Load(format!("Loader task failed: {}", e)))??;

        Ok(Box::new(model))
    }
}

/// Scan `dirs` for model configs.
///
/// A wake word id found in an earlier directory shadows later ones. Configs
/// of another type, configs whose model file is missing and unreadable
/// configs are skipped.
pub fn discover_models(dirs: &[PathBuf], config: &DetectorConfig) -> Vec<OnnxModelProvider> {
    let mut found: BTreeMap<String, OnnxModelProvider> = BTreeMap::new();

    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read model directory {}: {}", dir.display(), e);
                continue;
            }
        };

        let mut config_paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        config_paths.sort();

        for config_path in config_paths {
            let Some(name) = config_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if found.contains_key(name) {
                debug!("Skipping duplicate model {} in {}", name, dir.display());
                continue;
            }

            let file = match ModelConfigFile::from_file(&config_path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("Skipping model config: {}", e);
                    continue;
                }
            };

            if file.model_type != MODEL_TYPE {
                debug!("Not an ONNX wake-word model: {}", config_path.display());
                continue;
            }

            let model_path = dir.join(&file.model);
            if !model_path.is_file() {
                debug!("Missing model file: {}", model_path.display());
                continue;
            }

            info!("Found wake-word model {} ({})", name, file.wake_word);
            let provider = OnnxModelProvider::new(name.to_string(), &file, model_path, config);
            found.insert(name.to_string(), provider);
        }
    }

    found.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;
    use serde_json::json;
    use std::fs;

    fn write_model(dir: &Path, name: &str, config: Value, with_model_file: bool) {
        fs::write(dir.join(format!("{}.json", name)), config.to_string()).unwrap();
        if with_model_file {
            fs::write(dir.join(format!("{}.onnx", name)), b"not really onnx").unwrap();
        }
    }

    fn jarvis_config() -> Value {
        json!({
            "type": "onnx",
            "wake_word": "Hey Jarvis",
            "author": "kahrendt",
            "website": "https://example.org/jarvis",
            "model": "hey_jarvis.onnx",
            "trained_languages": ["en"],
            "version": 2
        })
    }

    #[test]
    fn test_discover_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "hey_jarvis", jarvis_config(), true);

        let config = DetectorConfig::default();
        let models = discover_models(&[dir.path().to_path_buf()], &config);
        assert_eq!(models.len(), 1);

        let descriptor = models[0].descriptor();
        assert_eq!(descriptor.name, "hey_jarvis");
        assert_eq!(descriptor.phrase, "Hey Jarvis");
        assert_eq!(descriptor.author, "kahrendt");
        assert_eq!(descriptor.website, "https://example.org/jarvis");
        assert_eq!(descriptor.languages, vec!["en".to_string()]);
        assert_eq!(descriptor.version, "2");
        assert_eq!(descriptor.window_length, config.window_length);
        assert_eq!(models[0].model_path(), dir.path().join("hey_jarvis.onnx"));
    }

    #[test]
    fn test_discover_skips_unusable_configs() {
        let dir = tempfile::tempdir().unwrap();

        let mut tflite = jarvis_config();
        tflite["type"] = json!("micro");
        tflite["model"] = json!("okay_nabu.onnx");
        write_model(dir.path(), "okay_nabu", tflite, true);

        let mut missing = jarvis_config();
        missing["model"] = json!("alexa.onnx");
        write_model(dir.path(), "alexa", missing, false);

        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let models = discover_models(&[dir.path().to_path_buf()], &DetectorConfig::default());
        assert!(models.is_empty());
    }

    #[test]
    fn test_earlier_directory_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_model(first.path(), "hey_jarvis", jarvis_config(), true);

        let mut shadowed = jarvis_config();
        shadowed["wake_word"] = json!("Hey Jarvis (old)");
        write_model(second.path(), "hey_jarvis", shadowed, true);

        let dirs = [
            first.path().to_path_buf(),
            second.path().to_path_buf(),
            PathBuf::from("/nonexistent/wakeword/models"),
        ];
        let models = discover_models(&dirs, &DetectorConfig::default());

        assert_eq!(models.len(), 1);
        assert_eq!(models[0].descriptor().phrase, "Hey Jarvis");
    }

    #[test]
    fn test_window_override_and_string_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut config_file = jarvis_config();
        config_file["window_length"] = json!(1280);
        config_file["version"] = json!("1.0.3");
        write_model(dir.path(), "hey_jarvis", config_file, true);

        let models = discover_models(&[dir.path().to_path_buf()], &DetectorConfig::default());
        assert_eq!(models[0].descriptor().window_length, 1280);
        assert_eq!(models[0].descriptor().version, "1.0.3");
    }

    #[test]
    fn test_registry_lists_custom_models() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "hey_jarvis", jarvis_config(), true);

        let config = DetectorConfig {
            custom_model_dirs: vec![dir.path().to_path_buf()],
            ..Default::default()
        };
        let registry = ModelRegistry::from_config(&config);

        assert!(registry.contains(crate::model::DEFAULT_MODEL));
        assert!(registry.contains("hey_jarvis"));
        assert!(registry.validate(&config).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_model_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "hey_jarvis", jarvis_config(), true);

        let models = discover_models(&[dir.path().to_path_buf()], &DetectorConfig::default());
        assert!(matches!(models[0].load().await, Err(ModelError::Load(_))));
    }
}
