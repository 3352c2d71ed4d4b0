/// Offline replay of WAV files through a detection session
///
/// Used by the `detect-wav` command to check a recording against the
/// configured models without a network client.

use crate::audio::{AudioChunk, AudioFormat, AudioSample};
use crate::detector::DetectionEvent;
use crate::manager::{SessionManager, StartRequest};
use crate::session::{SessionError, SessionStats};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Samples per replayed chunk
pub const REPLAY_CHUNK_SAMPLES: usize = 1024;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Outcome of a replay
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub detections: Vec<DetectionEvent>,
    pub stats: SessionStats,
}

/// Stream a WAV file through a fresh session in fixed-size chunks
pub async fn replay_wav(
    manager: &SessionManager,
    path: impl AsRef<Path>,
    wake_words: Vec<String>,
) -> Result<ReplayReport, ReplayError> {
    let path = path.as_ref();
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let format = AudioFormat::new(spec.sample_rate, spec.bits_per_sample, spec.channels);

    let session_id = format!("replay:{}", path.display());
    let request = StartRequest {
        format,
        wake_words,
        timestamp: Some(0),
    };
    manager.start_session(&session_id, request).await?;

    info!("Replaying {} ({})", path.display(), format);

    let detections = match stream_samples(manager, &session_id, format, &mut reader).await {
        Ok(detections) => detections,
        Err(e) => {
            // Fatal session errors already removed the session
            if let Err(stop_error) = manager.on_stop(&session_id).await {
                debug!("Replay session {} already gone: {}", session_id, stop_error);
            }
            return Err(e);
        }
    };

    let stats = manager.on_stop(&session_id).await?;

    Ok(ReplayReport { detections, stats })
}

async fn stream_samples<R: std::io::Read>(
    manager: &SessionManager,
    session_id: &str,
    format: AudioFormat,
    reader: &mut hound::WavReader<R>,
) -> Result<Vec<DetectionEvent>, ReplayError> {
    let samples: Vec<AudioSample> = reader.samples::<i16>().collect::<Result<_, _>>()?;
    let mut detections = Vec::new();

    for block in samples.chunks(REPLAY_CHUNK_SAMPLES) {
        let chunk = AudioChunk::from_samples(format, block, None);
        detections.extend(manager.on_audio_chunk(session_id, chunk).await?);
    }

    Ok(detections)
}
