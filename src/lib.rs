/// Streaming wake-word detection library
///
/// Bridges chunked microphone audio arriving over the network to wake-word
/// models: per-session ring buffering, fixed-stride windowing, threshold and
/// debounce policy, and a Wyoming-style event protocol on top.

pub mod audio;
pub mod audio_buffer;
pub mod config;
pub mod detector;
pub mod manager;
pub mod model;
pub mod onnx;
pub mod protocol;
pub mod replay;
pub mod server;
pub mod session;

// Re-export main types
pub use audio::{AudioChunk, AudioFormat, AudioSample, SAMPLE_RATE};
pub use audio_buffer::{AppendOutcome, AudioBuffer, AudioBufferError, Window};
pub use config::{ConfigError, DetectorConfig, OverrunPolicy};
pub use detector::{DetectionEvent, DetectionState, DetectionStateMachine};
pub use manager::{SessionManager, StartRequest};
pub use model::{
    EnergyModel, ModelDescriptor, ModelError, ModelInvoker, ModelProvider, ModelRegistry,
    WakeWordModel,
};
pub use onnx::{discover_models, ModelConfigFile, OnnxModel, OnnxModelProvider};
pub use protocol::{Event, InboundMessage, OutboundMessage, ProtocolError};
pub use replay::{replay_wav, ReplayError, ReplayReport};
pub use server::{ServerUri, WakeWordServer};
pub use session::{SessionError, SessionHandle, SessionId, SessionStats};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging.
///
/// Logs go to stderr: with `stdio://` stdout carries the event stream.
pub fn init_logging(debug: bool) {
    let default_directive = if debug {
        "wakeword_stream=debug,wakeword_service=debug"
    } else {
        "wakeword_stream=info,wakeword_service=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
