/// Session manager
///
/// Owns the id → session mapping and routes start/chunk/stop calls to the
/// right session. Sessions never share mutable state, so chunks for
/// different sessions run fully in parallel; chunks for one session are
/// serialised by that session's handle.

use crate::audio::{AudioChunk, AudioFormat};
use crate::config::DetectorConfig;
use crate::detector::DetectionEvent;
use crate::model::{ModelError, ModelRegistry};
use crate::session::{Session, SessionError, SessionHandle, SessionId, SessionStats};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Everything needed to open a session
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub format: AudioFormat,

    /// Wake words to run; empty means the configured defaults
    pub wake_words: Vec<String>,

    /// Client timestamp (ms) of the first sample
    pub timestamp: Option<u64>,
}

impl StartRequest {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }
}

pub struct SessionManager {
    config: DetectorConfig,
    registry: Arc<ModelRegistry>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionManager {
    /// Create a manager, checking configuration and model contracts up front
    pub fn new(config: DetectorConfig, registry: Arc<ModelRegistry>) -> Result<Self, SessionError> {
        config.validate()?;
        registry.validate(&config)?;

        for name in &config.default_models {
            if !registry.contains(name) {
                return Err(ModelError::UnknownModel(name.clone()).into());
            }
        }

        info!(
            "Session manager ready: window={} stride={} threshold={} hits={} refractory={}",
            config.window_length,
            config.stride,
            config.threshold,
            config.required_consecutive_hits,
            config.refractory_window_count
        );

        Ok(Self {
            config,
            registry,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Start a session with the default wake words
    pub async fn on_start(&self, id: &str, format: AudioFormat) -> Result<SessionHandle, SessionError> {
        self.start_session(id, StartRequest::new(format)).await
    }

    /// Start a session.
    ///
    /// An active session with the same id is cancelled and replaced.
    pub async fn start_session(
        &self,
        id: &str,
        request: StartRequest,
    ) -> Result<SessionHandle, SessionError> {
        let required = self.config.required_format();
        if request.format != required {
            warn!(
                "Rejecting session {}: format {} does not match {}",
                id, request.format, required
            );
            return Err(SessionError::UnsupportedFormat {
                declared: request.format,
                required,
            });
        }

        let mut invokers = Vec::new();
        for name in self.resolve_wake_words(&request.wake_words) {
            invokers.push(
                self.registry
                    .invoker(&name, self.config.reset_state_per_session)
                    .await?,
            );
        }

        let session = Session::new(
            id.to_string(),
            request.format,
            &self.config,
            invokers,
            request.timestamp,
        )?;
        let handle = SessionHandle::new(session);

        let previous = self
            .sessions
            .write()
            .await
            .insert(id.to_string(), handle.clone());

        if let Some(previous) = previous {
            warn!("Session {} restarted, discarding previous state", id);
            previous.cancel();
        }

        debug!("Session started: {} ({})", id, request.format);
        Ok(handle)
    }

    /// Route a chunk to its session and return any detections it produced.
    ///
    /// A session-fatal error terminates the session before it is returned.
    pub async fn on_audio_chunk(
        &self,
        id: &str,
        chunk: AudioChunk,
    ) -> Result<Vec<DetectionEvent>, SessionError> {
        let handle = self
            .session(id)
            .await
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;

        self.dispatch(&handle, chunk).await
    }

    /// Process a chunk on an already resolved session.
    ///
    /// Holding the handle pins the chunk to that session instance, so audio
    /// queued before a restart can never leak into the new session.
    pub async fn dispatch(
        &self,
        handle: &SessionHandle,
        chunk: AudioChunk,
    ) -> Result<Vec<DetectionEvent>, SessionError> {
        let result = handle.process_chunk(chunk).await;

        if let Err(e) = &result {
            if e.is_session_fatal() {
                error!("Session {} terminated: {}", handle.id(), e);
                self.terminate(handle).await;
            }
        }

        result
    }

    /// Stop a session, discarding its buffer and detection state
    pub async fn on_stop(&self, id: &str) -> Result<SessionStats, SessionError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;

        let stats = handle.close().await;
        debug!(
            "Session stopped: {} (windows={}, detections={}, overruns={})",
            id, stats.windows_scored, stats.detections, stats.overruns
        );

        Ok(stats)
    }

    /// Remove `handle` if it is still the active session for its id
    pub async fn terminate(&self, handle: &SessionHandle) {
        handle.cancel();

        let mut sessions = self.sessions.write().await;
        if sessions
            .get(handle.id())
            .is_some_and(|active| active.same_session(handle))
        {
            sessions.remove(handle.id());
        }
    }

    pub async fn session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn stats(&self, id: &str) -> Result<SessionStats, SessionError> {
        match self.session(id).await {
            Some(handle) => Ok(handle.stats().await),
            None => Err(SessionError::UnknownSession(id.to_string())),
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Known requested names, or the defaults if none are known
    fn resolve_wake_words(&self, requested: &[String]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in requested {
            if !self.registry.contains(name) {
                warn!("Unknown model name: {}", name);
            } else if !names.contains(name) {
                names.push(name.clone());
            }
        }

        if names.is_empty() {
            names = self.config.default_models.clone();
        }

        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        let config = DetectorConfig::default();
        let registry = Arc::new(ModelRegistry::with_builtin(&config));
        SessionManager::new(config, registry).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = DetectorConfig {
            threshold: 2.0,
            ..Default::default()
        };
        let registry = Arc::new(ModelRegistry::with_builtin(&DetectorConfig::default()));
        assert!(matches!(
            SessionManager::new(config, registry),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_model_shape_mismatch() {
        let config = DetectorConfig::default();
        let registry = Arc::new(ModelRegistry::with_builtin(&DetectorConfig {
            window_length: 1280,
            ..Default::default()
        }));
        assert!(matches!(
            SessionManager::new(config, registry),
            Err(SessionError::Model(ModelError::InvalidInputShape { .. }))
        ));
    }

    #[test]
    fn test_rejects_unknown_default_model() {
        let config = DetectorConfig {
            default_models: vec!["hey_nobody".to_string()],
            ..Default::default()
        };
        let registry = Arc::new(ModelRegistry::with_builtin(&config));
        assert!(matches!(
            SessionManager::new(config, registry),
            Err(SessionError::Model(ModelError::UnknownModel(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let manager = manager();

        manager.on_start("a", AudioFormat::default()).await.unwrap();
        assert_eq!(manager.active_sessions().await, 1);

        let stats = manager.on_stop("a").await.unwrap();
        assert_eq!(stats, SessionStats::default());
        assert_eq!(manager.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_session() {
        let manager = manager();
        assert!(matches!(
            manager.on_stop("ghost").await,
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_wake_words_fall_back_to_default() {
        let manager = manager();
        let request = StartRequest {
            wake_words: vec!["hey_nobody".to_string()],
            ..StartRequest::new(AudioFormat::default())
        };

        let handle = manager.start_session("a", request).await.unwrap();
        assert_eq!(handle.wake_words().await, vec!["energy".to_string()]);
    }

    #[tokio::test]
    async fn test_restart_cancels_previous() {
        let manager = manager();

        let first = manager.on_start("a", AudioFormat::default()).await.unwrap();
        let second = manager.on_start("a", AudioFormat::default()).await.unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(manager.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_terminate_ignores_replaced_session() {
        let manager = manager();

        let first = manager.on_start("a", AudioFormat::default()).await.unwrap();
        let second = manager.on_start("a", AudioFormat::default()).await.unwrap();

        manager.terminate(&first).await;
        let active = manager.session("a").await.unwrap();
        assert!(active.same_session(&second));
    }
}
