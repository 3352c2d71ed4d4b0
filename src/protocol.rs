/// Wire protocol adapter
///
/// Events are framed the Wyoming way: one JSON header line, then optional
/// JSON data bytes, then optional binary payload bytes, with the lengths
/// announced in the header. This module converts between those frames and
/// the typed messages the session layer works with.

use crate::audio::{AudioChunk, AudioFormat};
use crate::detector::DetectionEvent;
use crate::model::ModelDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version written into outgoing headers
pub const PROTOCOL_VERSION: &str = "1.5.2";

/// Upper bound on a header line
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Upper bound on data or payload sections
pub const MAX_SECTION_BYTES: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Header exceeds {0} bytes")]
    HeaderTooLong(usize),

    #[error("Section of {0} bytes exceeds limit")]
    SectionTooLarge(usize),

    #[error("Invalid {event_type} event: {reason}")]
    InvalidEvent { event_type: String, reason: String },
}

/// A single framed event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub data: Map<String, Value>,
    pub payload: Option<Vec<u8>>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Map::new(),
            payload: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = map;
        }
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

/// Read the next event; `Ok(None)` on a clean end of stream
pub async fn read_event<R>(reader: &mut R) -> Result<Option<Event>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(MAX_HEADER_BYTES as u64)
            .read_until(b'\n', &mut line)
            .await?;

        if read == 0 {
            return Ok(None);
        }

        if line.last() != Some(&b'\n') && read == MAX_HEADER_BYTES {
            return Err(ProtocolError::HeaderTooLong(MAX_HEADER_BYTES));
        }

        if !line.iter().all(u8::is_ascii_whitespace) {
            break;
        }
    }

    let header: Header = serde_json::from_slice(&line)?;
    let mut data = header.data.unwrap_or_default();

    if let Some(length) = header.data_length.filter(|&l| l > 0) {
        let bytes = read_section(reader, length).await?;
        let extra: Map<String, Value> = serde_json::from_slice(&bytes)?;
        data.extend(extra);
    }

    let payload = match header.payload_length.filter(|&l| l > 0) {
        Some(length) => Some(read_section(reader, length).await?),
        None => None,
    };

    Ok(Some(Event {
        event_type: header.event_type,
        data,
        payload,
    }))
}

async fn read_section<R>(reader: &mut R, length: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    if length > MAX_SECTION_BYTES {
        return Err(ProtocolError::SectionTooLarge(length));
    }

    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Write one event and flush
pub async fn write_event<W>(writer: &mut W, event: &Event) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let data = if event.data.is_empty() {
        None
    } else {
        Some(serde_json::to_vec(&event.data)?)
    };

    let header = Header {
        event_type: event.event_type.clone(),
        data: None,
        data_length: data.as_ref().map(Vec::len),
        payload_length: event.payload.as_ref().map(Vec::len).filter(|&l| l > 0),
        version: Some(PROTOCOL_VERSION.to_string()),
    };

    let mut frame = serde_json::to_vec(&header)?;
    frame.push(b'\n');
    if let Some(data) = &data {
        frame.extend_from_slice(data);
    }
    if let Some(payload) = &event.payload {
        frame.extend_from_slice(payload);
    }

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AudioData {
    rate: u32,
    width: u16,
    channels: u16,
    #[serde(default)]
    timestamp: Option<u64>,
}

impl AudioData {
    /// `None` when the byte width does not fit a bit depth
    fn format(&self) -> Option<AudioFormat> {
        let bit_depth = self.width.checked_mul(8)?;
        Some(AudioFormat::new(self.rate, bit_depth, self.channels))
    }
}

#[derive(Debug, Default, Deserialize)]
struct DetectData {
    #[serde(default)]
    names: Option<Vec<String>>,
}

/// Messages a client can send
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    AudioStart {
        format: AudioFormat,
        timestamp: Option<u64>,
    },
    AudioChunk(AudioChunk),
    AudioStop,
    /// Select wake words for the next session
    Detect { names: Vec<String> },
    Describe,
    Unknown(String),
}

impl InboundMessage {
    pub fn from_event(event: Event) -> Result<Self, ProtocolError> {
        let event_type = event.event_type.clone();
        let invalid = |reason: String| ProtocolError::InvalidEvent {
            event_type: event_type.clone(),
            reason,
        };

        let message = match event_type.as_str() {
            "audio-start" => {
                let audio: AudioData = serde_json::from_value(Value::Object(event.data))
                    .map_err(|e| invalid(e.to_string()))?;
                InboundMessage::AudioStart {
                    format: audio
                        .format()
                        .ok_or_else(|| invalid(format!("width {} is out of range", audio.width)))?,
                    timestamp: audio.timestamp,
                }
            }
            "audio-chunk" => {
                let audio: AudioData = serde_json::from_value(Value::Object(event.data))
                    .map_err(|e| invalid(e.to_string()))?;
                let format = audio
                    .format()
                    .ok_or_else(|| invalid(format!("width {} is out of range", audio.width)))?;
                InboundMessage::AudioChunk(AudioChunk::new(
                    format,
                    event.payload.unwrap_or_default(),
                    audio.timestamp,
                ))
            }
            "audio-stop" => InboundMessage::AudioStop,
            "detect" => {
                let detect: DetectData = serde_json::from_value(Value::Object(event.data))
                    .map_err(|e| invalid(e.to_string()))?;
                InboundMessage::Detect {
                    names: detect.names.unwrap_or_default(),
                }
            }
            "describe" => InboundMessage::Describe,
            _ => InboundMessage::Unknown(event_type.clone()),
        };

        Ok(message)
    }
}

/// Messages the service sends
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Detection {
        name: String,
        score: f32,
        timestamp: u64,
    },
    NotDetected,
    Info(Value),
    Error {
        text: String,
        code: Option<String>,
    },
}

impl OutboundMessage {
    /// Service description listing every registered model
    pub fn info<'a>(models: impl IntoIterator<Item = &'a ModelDescriptor>) -> Self {
        let attribution = json!({ "name": "AetherOS Team", "url": "" });
        let models: Vec<Value> = models
            .into_iter()
            .map(|m| {
                json!({
                    "name": m.name,
                    "description": m.phrase,
                    "phrase": m.phrase,
                    "attribution": { "name": m.author, "url": m.website },
                    "installed": true,
                    "languages": m.languages,
                    "version": m.version,
                })
            })
            .collect();

        OutboundMessage::Info(json!({
            "wake": [{
                "name": env!("CARGO_PKG_NAME"),
                "description": env!("CARGO_PKG_DESCRIPTION"),
                "attribution": attribution,
                "installed": true,
                "version": env!("CARGO_PKG_VERSION"),
                "models": models,
            }]
        }))
    }

    pub fn to_event(&self) -> Event {
        match self {
            OutboundMessage::Detection {
                name,
                score,
                timestamp,
            } => Event::new("detection").with_data(json!({
                "name": name,
                "score": score,
                "timestamp": timestamp,
            })),
            OutboundMessage::NotDetected => Event::new("not-detected"),
            OutboundMessage::Info(info) => Event::new("info").with_data(info.clone()),
            OutboundMessage::Error { text, code } => {
                Event::new("error").with_data(json!({ "text": text, "code": code }))
            }
        }
    }
}

impl From<&DetectionEvent> for OutboundMessage {
    fn from(event: &DetectionEvent) -> Self {
        OutboundMessage::Detection {
            name: event.wake_word_id.clone(),
            score: event.score,
            timestamp: event.timestamp,
        }
    }
}
