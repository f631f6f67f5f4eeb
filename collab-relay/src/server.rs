//! WebSocket relay server with per-document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌──► Client B
//!             ├── ?docId=doc1 ── DocumentRoom ───┤
//! Client B ──┘        │            (yrs Doc)     └──► Client A
//!                     │
//!                     └── apply frame, fan out verbatim (origin excluded)
//! ```
//!
//! Per-connection lifecycle:
//! ```text
//! Connecting ──(handshake, subscribe, snapshot sent)──► Bound ──► Closed
//!      │                                                            ▲
//!      └──────────────────── error at any point ────────────────────┘
//! ```
//!
//! Every connection runs in its own task. Inbound frames are applied and
//! broadcast in arrival order; outbound frames are drained from a bounded
//! queue, so a slow client only ever stalls itself.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{resolve_document_id, ConnectionId, DocumentId, Frame, DEFAULT_DOCUMENT_ID};
use crate::registry::{DocumentRegistry, DocumentRoom, RelayOutcome, Subscriber};

pub const ENV_HOST: &str = "RELAY_HOST";
pub const ENV_PORT: &str = "PORT";
pub const ENV_DEFAULT_DOC: &str = "RELAY_DEFAULT_DOC";
pub const ENV_QUEUE_CAPACITY: &str = "RELAY_QUEUE_CAPACITY";

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid value {value:?} for {key}")]
    InvalidConfig { key: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Document bound when a connection names none
    pub default_document: String,
    /// Frames buffered per connection before fan-out starts skipping it
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
            default_document: DEFAULT_DOCUMENT_ID.to_string(),
            outbound_queue_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `RELAY_HOST`, `PORT`, `RELAY_DEFAULT_DOC`
    /// and `RELAY_QUEUE_CAPACITY`.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            config.port = parse_var(ENV_PORT, &port)?;
        }
        if let Some(doc) = lookup(ENV_DEFAULT_DOC).filter(|d| !d.is_empty()) {
            config.default_document = doc;
        }
        if let Some(capacity) = lookup(ENV_QUEUE_CAPACITY) {
            let parsed: usize = parse_var(ENV_QUEUE_CAPACITY, &capacity)?;
            if parsed == 0 {
                return Err(RelayError::InvalidConfig {
                    key: ENV_QUEUE_CAPACITY,
                    value: capacity,
                });
            }
            config.outbound_queue_capacity = parsed;
        }

        Ok(config)
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: FromStr>(key: &'static str, value: &str) -> Result<T, RelayError> {
    value.trim().parse().map_err(|_| RelayError::InvalidConfig {
        key,
        value: value.to_string(),
    })
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub frames_rejected: u64,
    pub bytes_received: u64,
    pub deliveries_skipped: u64,
    pub active_documents: usize,
}

/// Lock-free counters behind [`ServerStats`].
#[derive(Default)]
struct StatCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_relayed: AtomicU64,
    frames_rejected: AtomicU64,
    bytes_received: AtomicU64,
    deliveries_skipped: AtomicU64,
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake parsed, registry lookup in progress
    Connecting,
    /// Subscribed and initial snapshot sent
    Bound,
    /// Terminal; unsubscribed
    Closed,
}

struct Connection {
    id: ConnectionId,
    doc_id: DocumentId,
    addr: SocketAddr,
    state: ConnectionState,
}

impl Connection {
    fn new(id: ConnectionId, doc_id: DocumentId, addr: SocketAddr) -> Self {
        Self { id, doc_id, addr, state: ConnectionState::Connecting }
    }

    fn transition(&mut self, next: ConnectionState) {
        log::debug!("{} ({}) {:?} -> {:?}", self.id, self.addr, self.state, next);
        self.state = next;
    }
}

/// State shared by the accept loop and every connection task.
struct Shared {
    registry: Arc<DocumentRegistry>,
    counters: StatCounters,
    default_document: DocumentId,
    queue_capacity: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Create a server with its own empty registry.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, Arc::new(DocumentRegistry::new()))
    }

    /// Create a server around an existing registry.
    pub fn with_registry(config: ServerConfig, registry: Arc<DocumentRegistry>) -> Self {
        let shared = Arc::new(Shared {
            registry,
            counters: StatCounters::default(),
            default_document: DocumentId::new(config.default_document.clone()),
            queue_capacity: config.outbound_queue_capacity.max(1),
        });
        Self { config, shared }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        Ok(TcpListener::bind(self.config.bind_addr()).await?)
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the task is dropped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Collaboration relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to teardown.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), RelayError> {
        let mut request_uri: Option<Uri> = None;
        let capture_uri = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            request_uri = Some(req.uri().clone());
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_uri).await?;

        let doc_id = resolve_document_id(request_uri.as_ref(), &shared.default_document);
        let mut connection = Connection::new(shared.registry.next_connection_id(), doc_id, addr);

        shared.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        shared.counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let room = shared.registry.get_or_create(&connection.doc_id).await;
        let (tx, rx) = mpsc::channel(shared.queue_capacity);
        let snapshot = room.subscribe(Subscriber::new(connection.id, tx)).await;

        let result = Self::relay(ws_stream, snapshot, rx, &room, &mut connection, &shared).await;

        // Teardown runs on every exit path.
        room.unsubscribe(connection.id).await;
        connection.transition(ConnectionState::Closed);
        shared.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!(
            "{} ({}) left doc {}",
            connection.id,
            connection.addr,
            connection.doc_id
        );

        result
    }

    /// Send the snapshot, then relay frames until the socket ends.
    async fn relay(
        ws_stream: WebSocketStream<TcpStream>,
        snapshot: Vec<u8>,
        mut outbound: mpsc::Receiver<Frame>,
        room: &DocumentRoom,
        connection: &mut Connection,
        shared: &Shared,
    ) -> Result<(), RelayError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender.send(Message::Binary(snapshot.into())).await?;
        connection.transition(ConnectionState::Bound);
        log::info!(
            "{} ({}) joined doc {}",
            connection.id,
            connection.addr,
            connection.doc_id
        );

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(frame))) => {
                            shared.counters.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);

                            match room.apply_and_broadcast(&frame, connection.id).await {
                                RelayOutcome::Relayed(outcome) => {
                                    shared.counters.frames_relayed.fetch_add(1, Ordering::Relaxed);
                                    shared.counters
                                        .deliveries_skipped
                                        .fetch_add(outcome.skipped as u64, Ordering::Relaxed);
                                    log::trace!(
                                        "{} relayed {} bytes on doc {} to {} peers",
                                        connection.id,
                                        frame.len(),
                                        connection.doc_id,
                                        outcome.delivered
                                    );
                                }
                                RelayOutcome::Rejected(e) => {
                                    shared.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                                    log::warn!(
                                        "Dropping frame from {} on doc {}: {e}",
                                        connection.id,
                                        connection.doc_id
                                    );
                                }
                            }
                        }

                        Some(Ok(Message::Text(_))) => {
                            log::warn!("Ignoring text frame from {}: binary updates only", connection.id);
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {}", connection.addr);
                            break;
                        }

                        Some(Err(e)) => {
                            return Err(e.into());
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::Binary(frame)).await?,
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            frames_relayed: c.frames_relayed.load(Ordering::Relaxed),
            frames_rejected: c.frames_rejected.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            deliveries_skipped: c.deliveries_skipped.load(Ordering::Relaxed),
            active_documents: self.shared.registry.document_count().await,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.shared.registry
    }
}
