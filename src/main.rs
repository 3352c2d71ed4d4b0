/// Wake-word detection service binary
///
/// Serves the streaming detection protocol, or replays a WAV file through
/// the same pipeline with `detect-wav`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wakeword_stream::{
    init_logging, replay_wav, DetectorConfig, ModelRegistry, ServerUri, SessionManager,
    WakeWordServer,
};

#[derive(Parser)]
#[command(name = "wakeword-service")]
#[command(about = "Streaming wake-word detection service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Detection threshold (0.0 - 1.0)
    #[arg(long, global = true)]
    threshold: Option<f32>,

    /// Consecutive windows above threshold needed to trigger
    #[arg(long, global = true)]
    required_hits: Option<u32>,

    /// Seconds before a wake word can be detected again
    #[arg(long, global = true)]
    refractory_seconds: Option<f32>,

    /// Wake word models to run by default (repeatable)
    #[arg(long = "model", global = true)]
    models: Vec<String>,

    /// Directory of ONNX wake-word configs (repeatable, earlier wins)
    #[arg(long = "custom-model-dir", global = true)]
    custom_model_dirs: Vec<PathBuf>,

    /// Log DEBUG messages
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve clients (default)
    Serve {
        /// unix://, tcp:// or stdio://
        #[arg(long, default_value = "tcp://0.0.0.0:10400")]
        uri: String,
    },

    /// Run a WAV file through a detection session and print detections
    DetectWav {
        /// 16-bit mono WAV file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = load_config(&cli)?;
    let registry = Arc::new(ModelRegistry::from_config(&config));
    let manager = Arc::new(
        SessionManager::new(config, registry).context("Failed to initialise detection")?,
    );

    match cli.command {
        None => serve(manager, "tcp://0.0.0.0:10400").await,
        Some(Commands::Serve { uri }) => serve(manager, &uri).await,
        Some(Commands::DetectWav { file }) => {
            let report = replay_wav(&manager, &file, cli.models.clone())
                .await
                .with_context(|| format!("Failed to replay {}", file.display()))?;

            for detection in &report.detections {
                println!("{}", serde_json::to_string(detection)?);
            }

            info!(
                "Replay finished: {} windows, {} detections",
                report.stats.windows_scored, report.stats.detections
            );
            Ok(())
        }
    }
}

async fn serve(manager: Arc<SessionManager>, uri: &str) -> Result<()> {
    let uri: ServerUri = uri.parse()?;
    let server = Arc::new(WakeWordServer::new(manager));
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        signal.cancel();
    });

    info!("Starting wake-word detection service");
    server.run(uri, shutdown).await?;
    info!("Wake-word detection service stopped");

    Ok(())
}

/// Defaults, then config file, then environment, then command line
fn load_config(cli: &Cli) -> Result<DetectorConfig> {
    let mut config = match &cli.config {
        Some(path) => DetectorConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => DetectorConfig::default(),
    };

    config.apply_env()?;

    if let Some(threshold) = cli.threshold {
        config.threshold = threshold;
    }

    if let Some(hits) = cli.required_hits {
        config.required_consecutive_hits = hits;
    }

    if let Some(seconds) = cli.refractory_seconds {
        config.set_refractory_seconds(seconds);
    }

    if !cli.models.is_empty() {
        config.default_models = cli.models.clone();
    }

    config
        .custom_model_dirs
        .extend(cli.custom_model_dirs.iter().cloned());

    config.validate()?;
    Ok(config)
}
