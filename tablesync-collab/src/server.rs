//! WebSocket server admitting collaborators into sheet sessions.
//!
//! ```text
//! TCP accept ─► handshake (path /ws/sheet/{id}/edit/)
//!                 │
//!                 ├─ DocumentRepository: sheet exists? deadline open?
//!                 ├─ SessionStore: session exists? else initialize
//!                 │
//!                 └─► Endpoint::start ─► Hub
//! ```
//!
//! Every refusal is a `{"type":"error","msg":...}` frame followed by a close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::SinkExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::documents::{DocumentRepository, RepositoryError, SheetRecord};
use crate::endpoint::{Endpoint, EndpointParams, OUTBOUND_CAPACITY};
use crate::hub::{Hub, HubHandle, HubStats, HUB_CHANNEL_CAPACITY};
use crate::matrix::MAX_ROWS;
use crate::protocol::{ErrorMessage, ProtocolError};
use crate::session::{SessionBackend, SessionStore, StoreTimeouts, SESSION_GRACE};

const SHEET_PATH_PREFIX: &str = "/ws/sheet/";
const SHEET_PATH_SUFFIX: &str = "/edit";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue depth per connection
    pub outbound_capacity: usize,
    /// Largest sheet served, header row included
    pub max_rows: usize,
    /// Buffer for each hub input channel
    pub hub_capacity: usize,
    /// How long a session outlives its sheet's deadline
    pub session_grace: Duration,
    pub store_timeouts: StoreTimeouts,
    /// Session store location, used by the binary to pick a backend
    pub redis_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            outbound_capacity: OUTBOUND_CAPACITY,
            max_rows: MAX_ROWS,
            hub_capacity: HUB_CHANNEL_CAPACITY,
            session_grace: SESSION_GRACE,
            store_timeouts: StoreTimeouts::default(),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `TABLESYNC_BIND_ADDR`, `REDIS_URL`,
    /// `TABLESYNC_OUTBOUND_CAPACITY` and `TABLESYNC_MAX_ROWS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("TABLESYNC_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        overlay_count(&lookup, "TABLESYNC_OUTBOUND_CAPACITY", &mut config.outbound_capacity);
        overlay_count(&lookup, "TABLESYNC_MAX_ROWS", &mut config.max_rows);
        config
    }
}

/// Replace `value` with a positive count from `key`, warning on junk.
fn overlay_count(lookup: &impl Fn(&str) -> Option<String>, key: &str, value: &mut usize) {
    if let Some(raw) = lookup(key) {
        match raw.parse::<usize>() {
            Ok(n) if n > 0 => *value = n,
            _ => log::warn!("Ignoring {key}={raw:?}, using {value}"),
        }
    }
}

/// Connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub admitted: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ServerError::WebSocket(e.to_string())
    }
}

/// Why a connection was turned away before joining a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnknownEndpoint,
    SheetNotFound,
    RepositoryUnavailable,
    DeadlinePassed,
    SessionCheckFailed,
    SessionInitFailed,
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::UnknownEndpoint => "Unknown endpoint.",
            Rejection::SheetNotFound => "The sheet you're trying to edit does not exist.",
            Rejection::RepositoryUnavailable => {
                "An unexpected error occurred while connecting. Please try again later."
            }
            Rejection::DeadlinePassed => "The deadline to edit this sheet has passed.",
            Rejection::SessionCheckFailed => {
                "An error occurred during initialization. Please try again later."
            }
            Rejection::SessionInitFailed => "Could not initialize collaborative session.",
        }
    }
}

/// The sheet id in `/ws/sheet/{id}/edit/`, trailing slash optional.
pub fn sheet_id_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(SHEET_PATH_PREFIX)?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let id = rest.strip_suffix(SHEET_PATH_SUFFIX)?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

struct Shared<B, R> {
    config: ServerConfig,
    store: Arc<SessionStore<B>>,
    repository: R,
    hub: HubHandle,
    stats: AtomicServerStats,
}

/// The sync server.
pub struct SyncServer<B, R> {
    shared: Arc<Shared<B, R>>,
}

impl<B: SessionBackend, R: DocumentRepository> SyncServer<B, R> {
    /// Build the server and spawn its hub. Must be called inside a tokio
    /// runtime.
    pub fn new(config: ServerConfig, backend: B, repository: R) -> Self {
        let hub = Hub::spawn(config.hub_capacity.max(1));
        Self::with_hub(config, backend, repository, hub)
    }

    pub fn with_hub(config: ServerConfig, backend: B, repository: R, hub: HubHandle) -> Self {
        let store = SessionStore::with_timeouts(backend, config.store_timeouts)
            .with_grace(config.session_grace);
        let shared = Arc::new(Shared {
            config,
            store: Arc::new(store),
            repository,
            hub,
            stats: AtomicServerStats::default(),
        });
        Self { shared }
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats.snapshot()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.shared.hub
    }

    pub fn hub_stats(&self) -> HubStats {
        self.shared.hub.stats()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn session_store(&self) -> &SessionStore<B> {
        &self.shared.store
    }
}

async fn handle_connection<B: SessionBackend, R: DocumentRepository>(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared<B, R>>,
) -> Result<(), ServerError> {
    let mut path = String::new();
    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, capture).await?;
    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("WebSocket connection established from {addr} on {path}");

    let (sheet_id, record) = match admit(&shared, &path).await {
        Ok(admitted) => admitted,
        Err(rejection) => {
            shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejected {addr} on {path}: {}", rejection.message());
            return reject(&mut ws, rejection).await;
        }
    };

    let params = EndpointParams {
        sheet_id,
        column_count: record.column_count(),
        max_rows: shared.config.max_rows,
        outbound_capacity: shared.config.outbound_capacity,
    };
    let endpoint = match Endpoint::start(ws, params, shared.store.clone(), shared.hub.clone()).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            log::error!("Could not admit {addr}: {e}");
            return Ok(());
        }
    };

    shared.stats.admitted.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    let id = endpoint.id();
    endpoint.join().await;
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Connection {id} from {addr} finished");
    Ok(())
}

/// Run the admission checks for a handshake on `path`.
async fn admit<B: SessionBackend, R: DocumentRepository>(
    shared: &Shared<B, R>,
    path: &str,
) -> Result<(String, SheetRecord), Rejection> {
    let sheet_id = sheet_id_from_path(path).ok_or(Rejection::UnknownEndpoint)?;

    let record = shared
        .repository
        .get_sheet(sheet_id)
        .await
        .map_err(|e| match e {
            RepositoryError::NotFound(_) => Rejection::SheetNotFound,
            RepositoryError::Backend(e) => {
                log::error!("Failed to load sheet {sheet_id}: {e}");
                Rejection::RepositoryUnavailable
            }
        })?;

    if record.deadline_passed(SystemTime::now()) {
        return Err(Rejection::DeadlinePassed);
    }

    let exists = shared
        .store
        .exists(sheet_id)
        .await
        .map_err(|_| Rejection::SessionCheckFailed)?;

    // Two first collaborators may both get here; both seed the same
    // durable data, so the later write is harmless.
    if !exists {
        shared
            .store
            .initialize(sheet_id, record.deadline, &record.data)
            .await
            .map_err(|_| Rejection::SessionInitFailed)?;
    }

    Ok((sheet_id.to_string(), record))
}

async fn reject<S>(ws: &mut WebSocketStream<S>, rejection: Rejection) -> Result<(), ServerError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let payload = ErrorMessage::new(rejection.message()).encode()?;
    ws.send(Message::text(payload)).await?;
    ws.close(None).await?;
    Ok(())
}
