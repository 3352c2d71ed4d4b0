/// Network front end
///
/// Each connection gets a reader loop, a writer task, and (while audio is
/// flowing) one worker task that owns the session's chunk queue. The reader
/// never scores audio itself. `audio-stop` waits for the queue to drain, so
/// every chunk sent before it is scored; a disconnect or restart cancels the
/// session while the worker is still busy with an earlier chunk.

use crate::audio::{AudioChunk, AudioFormat};
use crate::manager::{SessionManager, StartRequest};
use crate::protocol::{read_event, write_event, Event, InboundMessage, OutboundMessage};
use crate::session::{SessionError, SessionHandle};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid server URI: {0}")]
    InvalidUri(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the service listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerUri {
    Tcp(String),
    Unix(PathBuf),
    Stdio,
}

impl FromStr for ServerUri {
    type Err = ServerError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = uri.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(ServerError::InvalidUri(uri.to_string()));
            }
            Ok(ServerUri::Tcp(addr.to_string()))
        } else if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ServerError::InvalidUri(uri.to_string()));
            }
            Ok(ServerUri::Unix(PathBuf::from(path)))
        } else if uri == "stdio://" {
            Ok(ServerUri::Stdio)
        } else {
            Err(ServerError::InvalidUri(uri.to_string()))
        }
    }
}

/// Wake-word server bound to a session manager
pub struct WakeWordServer {
    manager: Arc<SessionManager>,
    next_client: AtomicU64,
}

impl WakeWordServer {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            next_client: AtomicU64::new(1),
        }
    }

    /// Serve until `shutdown` fires
    pub async fn run(self: Arc<Self>, uri: ServerUri, shutdown: CancellationToken) -> Result<(), ServerError> {
        match uri {
            ServerUri::Tcp(addr) => {
                let listener = TcpListener::bind(&addr).await?;
                info!("Listening on tcp://{}", listener.local_addr()?);
                self.serve_tcp(listener, shutdown).await
            }
            ServerUri::Unix(path) => self.serve_unix(path, shutdown).await,
            ServerUri::Stdio => {
                info!("Serving a single client over stdio");
                let stream = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
                tokio::select! {
                    _ = self.handle_connection(stream) => {}
                    _ = shutdown.cancelled() => {}
                }
                Ok(())
            }
        }
    }

    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!("Accepted connection from {}", peer);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.handle_connection(stream).await });
                }
                _ = shutdown.cancelled() => {
                    info!("Server shutting down");
                    return Ok(());
                }
            }
        }
    }

    #[cfg(unix)]
    async fn serve_unix(self: Arc<Self>, path: PathBuf, shutdown: CancellationToken) -> Result<(), ServerError> {
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)?;
        info!("Listening on unix://{}", path.display());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.handle_connection(stream).await });
                }
                _ = shutdown.cancelled() => {
                    info!("Server shutting down");
                    return Ok(());
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn serve_unix(self: Arc<Self>, path: PathBuf, _shutdown: CancellationToken) -> Result<(), ServerError> {
        Err(ServerError::InvalidUri(format!("unix://{}", path.display())))
    }

    /// Drive one client connection to completion
    pub async fn handle_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client_id = format!("client-{}", self.next_client.fetch_add(1, Ordering::Relaxed));
        debug!("Client connected: {}", client_id);

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Event>();
        let writer_id = client_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                if let Err(e) = write_event(&mut write_half, &event).await {
                    warn!("Failed to write to client {}: {}", writer_id, e);
                    break;
                }
            }
        });

        let mut connection = Connection {
            manager: Arc::clone(&self.manager),
            client_id: client_id.clone(),
            out_tx,
            wake_words: Vec::new(),
            worker: None,
            halted: false,
        };

        loop {
            match read_event(&mut reader).await {
                Ok(Some(event)) => match InboundMessage::from_event(event) {
                    Ok(message) => connection.handle(message).await,
                    Err(e) => {
                        warn!("Client {} sent a bad event: {}", client_id, e);
                        connection.send(OutboundMessage::Error {
                            text: e.to_string(),
                            code: Some("invalid-event".to_string()),
                        });
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Closing client {}: {}", client_id, e);
                    break;
                }
            }
        }

        connection.disconnect().await;
        drop(connection);

        if let Err(e) = writer.await {
            error!("Writer task for {} failed: {}", client_id, e);
        }
        debug!("Client disconnected: {}", client_id);
    }
}

/// Queue and task feeding one session
struct SessionWorker {
    chunks: mpsc::Sender<AudioChunk>,
    /// Resolves to the number of detections forwarded
    task: JoinHandle<u64>,
}

/// Per-connection state
struct Connection {
    manager: Arc<SessionManager>,
    client_id: String,
    out_tx: mpsc::UnboundedSender<Event>,
    /// Wake words picked by the last `detect`
    wake_words: Vec<String>,
    worker: Option<SessionWorker>,
    /// Session died; drop audio until the next start/stop
    halted: bool,
}

impl Connection {
    fn send(&self, message: OutboundMessage) {
        // Only fails once the writer is gone, i.e. the client left
        let _ = self.out_tx.send(message.to_event());
    }

    fn send_error(&self, e: &SessionError) {
        self.send(OutboundMessage::Error {
            text: e.to_string(),
            code: Some(e.code().to_string()),
        });
    }

    async fn handle(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Detect { names } => {
                debug!("Client {} selected wake words: {:?}", self.client_id, names);
                self.wake_words = names;
            }
            InboundMessage::Describe => {
                self.send(OutboundMessage::info(self.manager.registry().descriptors()));
                debug!("Sent info to client: {}", self.client_id);
            }
            InboundMessage::AudioStart { format, timestamp } => {
                self.start(format, timestamp).await;
            }
            InboundMessage::AudioChunk(chunk) => self.enqueue(chunk).await,
            InboundMessage::AudioStop => {
                let detections = self.finish_session().await;
                if detections == 0 {
                    self.send(OutboundMessage::NotDetected);
                    debug!("Audio stopped without detection from client: {}", self.client_id);
                }
            }
            InboundMessage::Unknown(event_type) => {
                debug!("Unexpected event from {}: {}", self.client_id, event_type);
            }
        }
    }

    async fn start(&mut self, format: AudioFormat, timestamp: Option<u64>) {
        if self.worker.is_some() {
            self.abort_session().await;
        }
        self.halted = false;

        let request = StartRequest {
            format,
            wake_words: self.wake_words.clone(),
            timestamp,
        };

        match self.manager.start_session(&self.client_id, request).await {
            Ok(handle) => self.worker = Some(self.spawn_worker(handle)),
            Err(e) => {
                warn!("Client {} could not start a session: {}", self.client_id, e);
                self.send_error(&e);
                self.halted = true;
            }
        }
    }

    async fn enqueue(&mut self, chunk: AudioChunk) {
        if self.halted {
            debug!("Dropping audio for halted session {}", self.client_id);
            return;
        }

        if self.worker.is_none() {
            self.start(chunk.format, chunk.timestamp).await;
        }

        let Some(worker) = &self.worker else {
            return;
        };

        if worker.chunks.send(chunk).await.is_err() {
            // Worker exited after a fatal error it already reported; it is
            // joined on the next stop
            self.halted = true;
        }
    }

    /// Score everything already queued, then stop the session.
    ///
    /// Returns how many detections were sent to the client.
    async fn finish_session(&mut self) -> u64 {
        self.halted = false;

        let Some(worker) = self.worker.take() else {
            return 0;
        };

        drop(worker.chunks);
        let detections = self.join_worker(worker.task).await;
        self.release_session().await;

        detections
    }

    /// Stop the session at once, discarding queued and in-flight audio
    async fn abort_session(&mut self) {
        self.halted = false;

        let Some(worker) = self.worker.take() else {
            return;
        };

        self.release_session().await;
        drop(worker.chunks);
        self.join_worker(worker.task).await;
    }

    async fn release_session(&self) {
        match self.manager.on_stop(&self.client_id).await {
            Ok(stats) => debug!(
                "Session {} closed after {} windows",
                self.client_id, stats.windows_scored
            ),
            // Already terminated by a fatal error
            Err(SessionError::UnknownSession(_)) => {}
            Err(e) => warn!("Error stopping session {}: {}", self.client_id, e),
        }
    }

    async fn join_worker(&self, task: JoinHandle<u64>) -> u64 {
        match task.await {
            Ok(detections) => detections,
            Err(e) => {
                error!("Session worker for {} failed: {}", self.client_id, e);
                0
            }
        }
    }

    async fn disconnect(&mut self) {
        self.abort_session().await;
    }

    fn spawn_worker(&self, handle: SessionHandle) -> SessionWorker {
        let (chunks, mut rx) = mpsc::channel::<AudioChunk>(self.manager.config().queue_depth);
        let manager = Arc::clone(&self.manager);
        let out_tx = self.out_tx.clone();

        let task = tokio::spawn(async move {
            let mut forwarded = 0u64;

            while let Some(chunk) = rx.recv().await {
                match manager.dispatch(&handle, chunk).await {
                    Ok(events) => {
                        for event in &events {
                            let _ = out_tx.send(OutboundMessage::from(event).to_event());
                        }
                        forwarded += events.len() as u64;
                    }
                    Err(SessionError::Cancelled(id)) => {
                        debug!("Session {} cancelled, dropping queued audio", id);
                        break;
                    }
                    Err(e) => {
                        let _ = out_tx.send(
                            OutboundMessage::Error {
                                text: e.to_string(),
                                code: Some(e.code().to_string()),
                            }
                            .to_event(),
                        );
                        if e.is_session_fatal() {
                            break;
                        }
                    }
                }
            }

            forwarded
        });

        SessionWorker { chunks, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        assert_eq!(
            "tcp://0.0.0.0:10400".parse::<ServerUri>().unwrap(),
            ServerUri::Tcp("0.0.0.0:10400".to_string())
        );
        assert_eq!(
            "unix:///tmp/wake.sock".parse::<ServerUri>().unwrap(),
            ServerUri::Unix(PathBuf::from("/tmp/wake.sock"))
        );
        assert_eq!("stdio://".parse::<ServerUri>().unwrap(), ServerUri::Stdio);
    }

    #[test]
    fn test_parse_invalid_uri() {
        assert!("http://localhost".parse::<ServerUri>().is_err());
        assert!("tcp://".parse::<ServerUri>().is_err());
    }
}
