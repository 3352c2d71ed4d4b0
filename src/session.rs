/// Streaming detection session
///
/// One session per client stream. A session owns its ring buffer, the
/// windowing cursor and one detection state machine per selected wake word.
/// Chunks are appended in arrival order; every time a full window is
/// available past the cursor it is scored by each model, fed through the
/// state machines, and the cursor advances by one stride.

use crate::audio::{decode_pcm16, AudioChunk, AudioFormat};
use crate::audio_buffer::{AudioBuffer, AudioBufferError};
use crate::config::{ConfigError, DetectorConfig, OverrunPolicy};
use crate::detector::{DetectionEvent, DetectionState, DetectionStateMachine};
use crate::model::{ModelError, ModelInvoker};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Session identifier (one per client stream)
pub type SessionId = String;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unsupported audio format: {declared} (models require {required})")]
    UnsupportedFormat {
        declared: AudioFormat,
        required: AudioFormat,
    },

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Buffer overrun: {overwritten} unread samples lost")]
    BufferOverrun { overwritten: usize },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Audio buffer error: {0}")]
    Buffer(#[from] AudioBufferError),

    #[error("Session cancelled: {0}")]
    Cancelled(SessionId),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Whether the session must be torn down after this error
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::UnsupportedFormat { .. }
                | SessionError::BufferOverrun { .. }
                | SessionError::Model(_)
                | SessionError::Buffer(_)
        )
    }

    /// Short machine-readable code reported to clients
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::UnsupportedFormat { .. } => "unsupported-format",
            SessionError::UnknownSession(_) => "unknown-session",
            SessionError::BufferOverrun { .. } => "buffer-overrun",
            SessionError::Model(ModelError::InvalidInputShape { .. }) => "invalid-input-shape",
            SessionError::Model(_) => "model-failure",
            SessionError::Buffer(_) => "buffer-error",
            SessionError::Cancelled(_) => "cancelled",
            SessionError::Config(_) => "invalid-config",
        }
    }
}

/// Per-session counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub samples_received: u64,
    pub windows_scored: u64,
    pub detections: u64,
    pub overruns: u64,
}

/// One wake word running inside a session
struct Detector {
    invoker: ModelInvoker,
    machine: DetectionStateMachine,
}

/// Session state; only ever touched through a [`SessionHandle`]
pub struct Session {
    id: SessionId,
    format: AudioFormat,
    buffer: AudioBuffer,
    detectors: Vec<Detector>,
    window_length: usize,
    stride: usize,
    overrun_policy: OverrunPolicy,
    /// Absolute sample position of the next window to score
    next_window: u64,
    /// Timestamp (ms) of sample 0, fixed by the start message or first chunk
    base_timestamp: Option<u64>,
    /// Dangling byte when a chunk ends mid-sample
    carry: Option<u8>,
    stats: SessionStats,
}

impl Session {
    /// Create a session, rejecting formats the models cannot consume
    pub fn new(
        id: SessionId,
        format: AudioFormat,
        config: &DetectorConfig,
        invokers: Vec<ModelInvoker>,
        start_timestamp: Option<u64>,
    ) -> Result<Self, SessionError> {
        let required = config.required_format();
        if format != required {
            return Err(SessionError::UnsupportedFormat {
                declared: format,
                required,
            });
        }

        let buffer = AudioBuffer::with_capacity(config.buffer_capacity)?;
        let detectors = invokers
            .into_iter()
            .map(|invoker| Detector {
                invoker,
                machine: DetectionStateMachine::from_config(config),
            })
            .collect();

        Ok(Self {
            id,
            format,
            buffer,
            detectors,
            window_length: config.window_length,
            stride: config.stride,
            overrun_policy: config.overrun_policy,
            next_window: 0,
            base_timestamp: start_timestamp,
            carry: None,
            stats: SessionStats::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Wake words running in this session
    pub fn wake_words(&self) -> Vec<String> {
        self.detectors
            .iter()
            .map(|d| d.invoker.wake_word_id().to_string())
            .collect()
    }

    /// Current state of every detector, in wake-word order
    pub fn detection_states(&self) -> Vec<DetectionState> {
        self.detectors.iter().map(|d| d.machine.state()).collect()
    }

    /// Append a chunk and score every window it completes.
    ///
    /// Once `cancel` fires nothing more is emitted: a score that arrives
    /// after cancellation is dropped along with any events from this chunk.
    pub async fn process_chunk(
        &mut self,
        chunk: AudioChunk,
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectionEvent>, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled(self.id.clone()));
        }

        if chunk.format != self.format {
            return Err(SessionError::UnsupportedFormat {
                declared: chunk.format,
                required: self.format,
            });
        }

        if self.base_timestamp.is_none() {
            self.base_timestamp = Some(chunk.timestamp.unwrap_or(0));
        }

        let samples = decode_pcm16(&chunk.bytes, &mut self.carry);
        self.stats.samples_received += samples.len() as u64;

        let outcome = self.buffer.append(&samples);
        if outcome.overrun() {
            self.stats.overruns += 1;

            if self.overrun_policy == OverrunPolicy::Fatal {
                return Err(SessionError::BufferOverrun {
                    overwritten: outcome.overwritten,
                });
            }

            warn!(
                "Session {} overran its buffer, resuming on freshest audio ({} samples lost)",
                self.id, outcome.overwritten
            );
            self.next_window = self.next_window.max(self.buffer.oldest_position());
        }

        let mut events = Vec::new();

        loop {
            let (window, window_end) = match self.buffer.window(self.next_window, self.window_length) {
                Ok(window) => (window.to_vec(), window.end()),
                // Not enough audio for the next window yet
                Err(AudioBufferError::InsufficientData { .. }) => break,
                Err(e) => return Err(e.into()),
            };
            let timestamp = self.window_timestamp(window_end);

            for detector in &mut self.detectors {
                let score = detector.invoker.score(window.clone()).await?;

                if cancel.is_cancelled() {
                    debug!("Session {} cancelled during scoring, dropping result", self.id);
                    return Err(SessionError::Cancelled(self.id.clone()));
                }

                trace!(
                    "Session {} window @{} {}: score={:.3}",
                    self.id,
                    self.next_window,
                    detector.invoker.wake_word_id(),
                    score
                );

                if let Some(trigger) = detector.machine.observe(score, timestamp) {
                    info!(
                        "Wake-word detected! session={}, wake_word={}, score={:.2}, timestamp={}",
                        self.id,
                        detector.invoker.wake_word_id(),
                        trigger.score,
                        trigger.timestamp
                    );

                    events.push(DetectionEvent {
                        session_id: self.id.clone(),
                        wake_word_id: detector.invoker.wake_word_id().to_string(),
                        score: trigger.score,
                        timestamp: trigger.timestamp,
                    });
                }
            }

            self.stats.windows_scored += 1;
            self.next_window += self.stride as u64;
            self.buffer.release(self.next_window);
        }

        self.stats.detections += events.len() as u64;

        if self.stats.windows_scored > 0 && self.stats.windows_scored % 1000 == 0 {
            debug!(
                "Session {}: scored {} windows, detected {} wake-words",
                self.id, self.stats.windows_scored, self.stats.detections
            );
        }

        Ok(events)
    }

    /// Timestamp of the window ending at absolute sample `end`
    fn window_timestamp(&self, end: u64) -> u64 {
        self.base_timestamp.unwrap_or(0) + self.format.samples_to_millis(end)
    }
}

/// Shared handle to a running session.
///
/// The mutex serialises chunk processing; the token lets a stop or
/// disconnect interrupt a chunk that is already being scored.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            id: session.id.clone(),
            session: Arc::new(Mutex::new(session)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process one chunk, in order with every other chunk for this session
    pub async fn process_chunk(&self, chunk: AudioChunk) -> Result<Vec<DetectionEvent>, SessionError> {
        let mut session = self.session.lock().await;
        session.process_chunk(chunk, &self.cancel).await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when the session is stopped
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel, wait for any in-flight chunk to finish, and return final stats
    pub async fn close(&self) -> SessionStats {
        self.cancel.cancel();
        let session = self.session.lock().await;
        session.stats.clone()
    }

    pub async fn stats(&self) -> SessionStats {
        self.session.lock().await.stats.clone()
    }

    pub async fn detection_states(&self) -> Vec<DetectionState> {
        self.session.lock().await.detection_states()
    }

    pub async fn wake_words(&self) -> Vec<String> {
        self.session.lock().await.wake_words()
    }

    /// Whether both handles refer to the same session instance
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}
