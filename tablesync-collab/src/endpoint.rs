//! One collaborator's WebSocket connection.
//!
//! ```text
//!                  ┌──────────── Endpoint ────────────┐
//! socket ── read ─►│ inbound: decode → shift row →    │── apply ──► SessionStore
//!                  │          apply → broadcast       │── submit ─► Hub
//!                  │                                  │
//! socket ◄─ write ─│ outbound: snapshot, then queue   │◄─ try_send ─ Hub
//!                  └──────────────────────────────────┘
//!                           shared Shutdown signal
//! ```
//!
//! Both loops run as their own tasks. Whichever ends first fires the
//! [`Shutdown`], which stops the other; the supervising task then
//! unregisters from the hub. The outbound loop owns the write half, so it is
//! the one that sends the close frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::hub::{BroadcastMessage, EndpointHandle, EndpointId, HubClosed, HubHandle};
use crate::matrix;
use crate::protocol::{self, CloseReason, Edit, ProtocolError};
use crate::session::{SessionBackend, SessionStore, StoreError};

/// Default outbound queue depth per connection.
pub const OUTBOUND_CAPACITY: usize = 50;

/// Endpoint lifecycle once [`Endpoint::start`] returns. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closed,
}

/// Fire-once close signal shared by an endpoint's loops and the hub.
///
/// The first [`close`](Shutdown::close) wins and records its reason; later
/// calls are no-ops. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    fired: AtomicBool,
    reason: watch::Sender<Option<CloseReason>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            inner: Arc::new(ShutdownInner {
                fired: AtomicBool::new(false),
                reason,
            }),
        }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.reason.send_replace(Some(reason));
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// The winning reason, once fired.
    pub fn reason(&self) -> Option<CloseReason> {
        *self.inner.reason.borrow()
    }

    /// Resolves once the signal has fired.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.reason.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let fired = rx.wait_for(Option::is_some).await.map(|reason| *reason);
        fired.ok().flatten().unwrap_or(CloseReason::Normal)
    }
}

/// What an endpoint needs to know about the sheet it serves.
#[derive(Debug, Clone)]
pub struct EndpointParams {
    pub sheet_id: String,
    /// Header width; snapshot rows are cut to this many columns.
    pub column_count: usize,
    /// Row cap, header included. Edits and stored cells past it are refused.
    pub max_rows: usize,
    pub outbound_capacity: usize,
}

impl EndpointParams {
    pub fn new(sheet_id: impl Into<String>, column_count: usize) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            column_count,
            max_rows: matrix::MAX_ROWS,
            outbound_capacity: OUTBOUND_CAPACITY,
        }
    }
}

struct Context<B> {
    id: EndpointId,
    sheet_id: String,
    column_count: usize,
    max_rows: usize,
    store: Arc<SessionStore<B>>,
    hub: HubHandle,
    shutdown: Shutdown,
}

/// A joined connection: registered with the hub, loops running.
pub struct Endpoint {
    id: EndpointId,
    sheet_id: String,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl Endpoint {
    /// Register with the hub and start both loops on `ws`.
    ///
    /// Fails only if the hub is gone; the socket is dropped in that case.
    pub async fn start<S, B>(
        ws: WebSocketStream<S>,
        params: EndpointParams,
        store: Arc<SessionStore<B>>,
        hub: HubHandle,
    ) -> Result<Endpoint, HubClosed>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: SessionBackend,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(params.outbound_capacity.max(1));
        let shutdown = Shutdown::new();
        let handle = EndpointHandle::new(params.sheet_id.clone(), outbound_tx, shutdown.clone());
        let id = handle.id();

        // Registered before the snapshot is read, so no edit applied after
        // the read can miss this endpoint.
        hub.register(handle.clone()).await?;
        log::info!("Endpoint {id} active on sheet {}", params.sheet_id);

        let ctx = Arc::new(Context {
            id,
            sheet_id: params.sheet_id.clone(),
            column_count: params.column_count,
            max_rows: params.max_rows,
            store,
            hub: hub.clone(),
            shutdown: shutdown.clone(),
        });

        let (sink, stream) = ws.split();
        let inbound = tokio::spawn(read_edits(stream, ctx.clone()));
        let outbound = tokio::spawn(write_edits(sink, outbound_rx, ctx));

        let task = tokio::spawn(supervise(inbound, outbound, handle, hub, shutdown.clone()));

        Ok(Endpoint {
            id,
            sheet_id: params.sheet_id,
            shutdown,
            task,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn sheet_id(&self) -> &str {
        &self.sheet_id
    }

    pub fn state(&self) -> ConnectionState {
        if self.shutdown.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Active
        }
    }

    /// Close the connection with `reason`. Idempotent.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.shutdown.close(reason)
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Wait for both loops to finish and the hub to be told.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::error!("Endpoint {} supervisor failed: {e}", self.id);
        }
    }
}

async fn supervise(
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
    handle: EndpointHandle,
    hub: HubHandle,
    shutdown: Shutdown,
) {
    let id = handle.id();
    // Whichever loop ends first, however it ends, stops the other.
    let guard = |side: &'static str, task: JoinHandle<()>| {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = task.await {
                log::error!("Endpoint {id} {side} loop failed: {e}");
            }
            shutdown.close(CloseReason::ConnectionFault);
        }
    };
    tokio::join!(guard("inbound", inbound), guard("outbound", outbound));

    let sheet_id = handle.sheet_id().to_string();
    if hub.unregister(handle).await.is_err() {
        log::debug!("Hub gone before endpoint {id} could unregister");
    }
    log::info!(
        "Endpoint {id} closed on sheet {sheet_id} ({:?})",
        shutdown.reason().unwrap_or(CloseReason::Normal)
    );
}

async fn read_edits<S, B>(mut stream: SplitStream<WebSocketStream<S>>, ctx: Arc<Context<B>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: SessionBackend,
{
    loop {
        let frame = tokio::select! {
            _ = ctx.shutdown.closed() => return,
            frame = stream.next() => frame,
        };

        let edit = match frame {
            Some(Ok(Message::Text(text))) => Edit::decode(text.as_str()),
            Some(Ok(Message::Binary(data))) => serde_json::from_slice::<Edit>(&data)
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
            Some(Ok(Message::Close(_))) | None => {
                log::debug!("Endpoint {} closed by peer", ctx.id);
                ctx.shutdown.close(CloseReason::Normal);
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::warn!("Endpoint {} read failed: {e}", ctx.id);
                ctx.shutdown.close(CloseReason::ConnectionFault);
                return;
            }
        };

        let edit = match edit {
            Ok(edit) => edit,
            Err(e) => {
                log::warn!("Endpoint {} sent an unreadable edit: {e}", ctx.id);
                ctx.shutdown.close(CloseReason::UnreadableEdit);
                return;
            }
        };

        if let Err(reason) = apply_and_forward(&ctx, edit).await {
            ctx.shutdown.close(reason);
            return;
        }
    }
}

/// Store the edit with the header offset, then broadcast it unshifted.
///
/// Edits outside the sheet's columns or row cap are refused before the
/// store or any peer sees them.
async fn apply_and_forward<B: SessionBackend>(ctx: &Context<B>, edit: Edit) -> Result<(), CloseReason> {
    let stored = edit.to_store_row().ok_or(CloseReason::UnreadableEdit)?;
    if stored.row >= ctx.max_rows || stored.col >= ctx.column_count {
        log::warn!(
            "Endpoint {} sent edit at {}:{} outside sheet {} ({} columns, {} rows max)",
            ctx.id,
            edit.row,
            edit.col,
            ctx.sheet_id,
            ctx.column_count,
            ctx.max_rows
        );
        return Err(CloseReason::UnreadableEdit);
    }

    ctx.store
        .apply_edit(&ctx.sheet_id, &stored)
        .await
        .map_err(|e| match e {
            StoreError::InvalidEdit => CloseReason::HeaderEdit,
            StoreError::Timeout(_) | StoreError::Backend(_) => CloseReason::EditNotSaved,
        })?;

    let msg = BroadcastMessage {
        sheet_id: ctx.sheet_id.clone(),
        edit,
        origin: Some(ctx.id),
    };
    ctx.hub.broadcast(msg).await.map_err(|_| {
        log::error!("Hub gone; dropping endpoint {}", ctx.id);
        CloseReason::ServerShutdown
    })
}

async fn write_edits<S, B>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: mpsc::Receiver<Edit>,
    ctx: Arc<Context<B>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    B: SessionBackend,
{
    let writable = stream_edits(&mut sink, &mut queue, &ctx).await;

    let reason = ctx.shutdown.reason().unwrap_or(CloseReason::Normal);
    if writable && reason != CloseReason::Normal {
        if let Err(e) = sink.send(reason.frame()).await {
            log::debug!("Endpoint {} close frame not sent: {e}", ctx.id);
        }
    }
    let _ = sink.close().await;
}

/// Snapshot first, then queued edits until shutdown.
///
/// Returns whether the socket is still writable.
async fn stream_edits<S, B>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    queue: &mut mpsc::Receiver<Edit>,
    ctx: &Context<B>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: SessionBackend,
{
    let snapshot = match load_snapshot(ctx).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::error!("Endpoint {} could not load snapshot: {e}", ctx.id);
            ctx.shutdown.close(CloseReason::SnapshotUnavailable);
            return true;
        }
    };
    if ctx.shutdown.is_closed() {
        return true;
    }
    if let Err(e) = sink.send(Message::text(snapshot)).await {
        log::warn!("Endpoint {} snapshot write failed: {e}", ctx.id);
        ctx.shutdown.close(CloseReason::ConnectionFault);
        return false;
    }

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.closed() => return true,
            edit = queue.recv() => {
                let Some(edit) = edit else {
                    ctx.shutdown.close(CloseReason::Normal);
                    return true;
                };
                let text = match edit.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Endpoint {} could not encode edit: {e}", ctx.id);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    log::warn!("Endpoint {} write failed: {e}", ctx.id);
                    ctx.shutdown.close(CloseReason::ConnectionFault);
                    return false;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SnapshotError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Coords(#[from] crate::coords::CoordError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

async fn load_snapshot<B: SessionBackend>(ctx: &Context<B>) -> Result<String, SnapshotError> {
    let cells = ctx.store.get_all(&ctx.sheet_id).await?;
    let matrix = matrix::build_with_limit(&cells, ctx.column_count, ctx.max_rows)?;
    Ok(protocol::encode_snapshot(&matrix)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::matrix::Matrix;
    use crate::protocol::ServerFrame;
    use crate::session::MemoryBackend;
    use std::time::{Duration, SystemTime};
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type Peer = WebSocketStream<DuplexStream>;

    async fn socket_pair() -> (WebSocketStream<DuplexStream>, Peer) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    fn sheet(rows: &[&[&str]]) -> Matrix {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    async fn seeded_store(sheet_id: &str, data: &Matrix) -> Arc<SessionStore<MemoryBackend>> {
        let store = SessionStore::new(MemoryBackend::new());
        let deadline = SystemTime::now() + Duration::from_secs(3600);
        store.initialize(sheet_id, deadline, data).await.unwrap();
        Arc::new(store)
    }

    async fn next_frame(peer: &mut Peer) -> Message {
        timeout(Duration::from_secs(2), peer.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read failed")
    }

    async fn next_server_frame(peer: &mut Peer) -> ServerFrame {
        match next_frame(peer).await {
            Message::Text(text) => ServerFrame::decode(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn expect_close(peer: &mut Peer, code: CloseCode, reason: &str) {
        match next_frame(peer).await {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, code);
                assert_eq!(frame.reason.as_str(), reason);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    async fn send_edit(peer: &mut Peer, edit: &Edit) {
        peer.send(Message::text(edit.encode().unwrap())).await.unwrap();
    }

    #[test]
    fn test_shutdown_fires_once() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_closed());
        assert!(shutdown.close(CloseReason::HeaderEdit));
        assert!(!shutdown.close(CloseReason::Normal));
        assert!(shutdown.is_closed());
        assert_eq!(shutdown.reason(), Some(CloseReason::HeaderEdit));
    }

    #[tokio::test]
    async fn test_concurrent_close_fires_once() {
        let shutdown = Shutdown::new();
        let waiter = {
            let s = shutdown.clone();
            tokio::spawn(async move { s.closed().await })
        };

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let s = shutdown.clone();
            tasks.push(tokio::spawn(async move { s.close(CloseReason::SlowConsumer) }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(waiter.await.unwrap(), CloseReason::SlowConsumer);
        // Waiting after the fact resolves immediately.
        assert_eq!(shutdown.closed().await, CloseReason::SlowConsumer);
    }

    #[tokio::test]
    async fn test_sends_snapshot_first() {
        let data = sheet(&[&["Name", "Email"], &["ada", "ada@example.com"]]);
        let store = seeded_store("s1", &data).await;
        let hub = Hub::spawn(16);
        let (server, mut peer) = socket_pair().await;

        let endpoint = Endpoint::start(server, EndpointParams::new("s1", 2), store, hub.clone())
            .await
            .unwrap();
        assert_eq!(endpoint.state(), ConnectionState::Active);
        assert_eq!(next_server_frame(&mut peer).await, ServerFrame::Snapshot(data));
        assert_eq!(hub.room_size("s1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_edit_shifted_for_store_and_broadcast_unshifted() {
        let data = sheet(&[&["Name", "Email"], &["ada", "ada@example.com"]]);
        let store = seeded_store("s1", &data).await;
        let hub = Hub::spawn(16);

        let (server_a, mut alice) = socket_pair().await;
        let (server_b, mut bob) = socket_pair().await;
        let _a = Endpoint::start(server_a, EndpointParams::new("s1", 2), store.clone(), hub.clone())
            .await
            .unwrap();
        let _b = Endpoint::start(server_b, EndpointParams::new("s1", 2), store.clone(), hub.clone())
            .await
            .unwrap();
        next_server_frame(&mut alice).await;
        next_server_frame(&mut bob).await;

        let edit = Edit::new(0, 1, "ada@example.org");
        send_edit(&mut alice, &edit).await;

        assert_eq!(next_server_frame(&mut bob).await, ServerFrame::Edit(edit));
        let cells = store.get_all("s1").await.unwrap();
        assert_eq!(cells["1:1"], "ada@example.org");
        assert_eq!(cells["0:1"], "Email");

        // The originator does not hear its own edit back.
        assert!(timeout(Duration::from_millis(100), alice.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_edits_from_one_connection_arrive_in_order() {
        let store = seeded_store("s1", &sheet(&[&["A"]])).await;
        let hub = Hub::spawn(16);
        let (server_a, mut alice) = socket_pair().await;
        let (server_b, mut bob) = socket_pair().await;
        let _a = Endpoint::start(server_a, EndpointParams::new("s1", 1), store.clone(), hub.clone())
            .await
            .unwrap();
        let _b = Endpoint::start(server_b, EndpointParams::new("s1", 1), store.clone(), hub.clone())
            .await
            .unwrap();
        next_server_frame(&mut alice).await;
        next_server_frame(&mut bob).await;

        for i in 0..20 {
            send_edit(&mut alice, &Edit::new(i, 0, i.to_string())).await;
        }
        for i in 0..20 {
            assert_eq!(
                next_server_frame(&mut bob).await,
                ServerFrame::Edit(Edit::new(i, 0, i.to_string()))
            );
        }
    }

    #[tokio::test]
    async fn test_unreadable_edit_closes_with_reason() {
        let store = seeded_store("s1", &sheet(&[&["A"]])).await;
        let hub = Hub::spawn(16);
        let (server, mut peer) = socket_pair().await;
        let endpoint = Endpoint::start(server, EndpointParams::new("s1", 1), store, hub.clone())
            .await
            .unwrap();
        next_server_frame(&mut peer).await;

        peer.send(Message::text(r#"{"row":"zero"}"#)).await.unwrap();
        expect_close(&mut peer, CloseCode::Invalid, "server was unable to read your edits").await;

        timeout(Duration::from_secs(2), endpoint.join()).await.unwrap();
        assert_eq!(hub.room_size("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_failure_closes_connection() {
        let store = Arc::new(SessionStore::new(FlakyBackend::default()));
        let hub = Hub::spawn(16);
        let (server, mut peer) = socket_pair().await;
        let _endpoint = Endpoint::start(server, EndpointParams::new("s1", 1), store, hub)
            .await
            .unwrap();
        next_server_frame(&mut peer).await;

        send_edit(&mut peer, &Edit::new(0, 0, "x")).await;
        expect_close(&mut peer, CloseCode::Again, CloseReason::EditNotSaved.message()).await;
    }

    #[tokio::test]
    async fn test_snapshot_failure_closes_before_steady_state() {
        let store = Arc::new(SessionStore::new(MemoryBackend::new()));
        store.backend().set_field("s1", "bad-key", "x").await.unwrap();
        let hub = Hub::spawn(16);
        let (server, mut peer) = socket_pair().await;
        let endpoint = Endpoint::start(server, EndpointParams::new("s1", 1), store, hub)
            .await
            .unwrap();

        expect_close(&mut peer, CloseCode::Again, CloseReason::SnapshotUnavailable.message()).await;
        timeout(Duration::from_secs(2), endpoint.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_past_row_cap_closes_without_storing() {
        let store = seeded_store("s1", &sheet(&[&["A"]])).await;
        let hub = Hub::spawn(16);
        let (server_a, mut alice) = socket_pair().await;
        let (server_b, mut bob) = socket_pair().await;
        let alice_ep = Endpoint::start(server_a, EndpointParams::new("s1", 1), store.clone(), hub.clone())
            .await
            .unwrap();
        let _b = Endpoint::start(server_b, EndpointParams::new("s1", 1), store.clone(), hub.clone())
            .await
            .unwrap();
        next_server_frame(&mut alice).await;
        next_server_frame(&mut bob).await;

        send_edit(&mut alice, &Edit::new(1_000_000_000_000, 0, "x")).await;
        expect_close(&mut alice, CloseCode::Invalid, CloseReason::UnreadableEdit.message()).await;
        timeout(Duration::from_secs(2), alice_ep.join()).await.unwrap();

        assert!(timeout(Duration::from_millis(100), bob.next()).await.is_err());
        assert_eq!(store.get_all("s1").await.unwrap().len(), 1);
        assert_eq!(hub.room_size("s1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_row_cap_counts_header() {
        let store = seeded_store("s1", &sheet(&[&["A"]])).await;
        let hub = Hub::spawn(16);
        let mut params = EndpointParams::new("s1", 1);
        params.max_rows = 3;

        let (server, mut peer) = socket_pair().await;
        let _endpoint = Endpoint::start(server, params, store.clone(), hub)
            .await
            .unwrap();
        next_server_frame(&mut peer).await;

        // Body row 1 is stored row 2, the last one allowed.
        send_edit(&mut peer, &Edit::new(1, 0, "last")).await;
        send_edit(&mut peer, &Edit::new(2, 0, "over")).await;
        expect_close(&mut peer, CloseCode::Invalid, CloseReason::UnreadableEdit.message()).await;

        let cells = store.get_all("s1").await.unwrap();
        assert_eq!(cells["2:0"], "last");
        assert!(!cells.contains_key("3:0"));
    }

    #[tokio::test]
    async fn test_edit_past_last_column_closes_without_broadcast() {
        let store = seeded_store("s1", &sheet(&[&["Name", "Email"]])).await;
        let hub = Hub::spawn(16);
        let (server_a, mut alice) = socket_pair().await;
        let (server_b, mut bob) = socket_pair().await;
        let _a = Endpoint::start(server_a, EndpointParams::new("s1", 2), store.clone(), hub.clone())
            .await
            .unwrap();
        let _b = Endpoint::start(server_b, EndpointParams::new("s1", 2), store.clone(), hub.clone())
            .await
            .unwrap();
        next_server_frame(&mut alice).await;
        next_server_frame(&mut bob).await;

        send_edit(&mut alice, &Edit::new(0, 2, "x")).await;
        expect_close(&mut alice, CloseCode::Invalid, CloseReason::UnreadableEdit.message()).await;

        assert!(timeout(Duration::from_millis(100), bob.next()).await.is_err());
        assert!(!store.get_all("s1").await.unwrap().contains_key("1:2"));
    }

    #[tokio::test]
    async fn test_oversized_stored_row_fails_only_that_snapshot() {
        let store = seeded_store("s1", &sheet(&[&["A"]])).await;
        let hub = Hub::spawn(16);
        let (server_a, mut alice) = socket_pair().await;
        let _a = Endpoint::start(server_a, EndpointParams::new("s1", 1), store.clone(), hub.clone())
            .await
            .unwrap();
        next_server_frame(&mut alice).await;

        // Written behind the endpoint's back, as another process could.
        store
            .backend()
            .set_field("s1", "1000000000001:0", "x")
            .await
            .unwrap();

        let (server_b, mut bob) = socket_pair().await;
        let bob_ep = Endpoint::start(server_b, EndpointParams::new("s1", 1), store.clone(), hub.clone())
            .await
            .unwrap();
        expect_close(&mut bob, CloseCode::Again, CloseReason::SnapshotUnavailable.message()).await;
        timeout(Duration::from_secs(2), bob_ep.join()).await.unwrap();

        // The earlier connection is untouched.
        assert_eq!(hub.room_size("s1").await.unwrap(), Some(1));
        send_edit(&mut alice, &Edit::new(0, 0, "still here")).await;
        assert!(timeout(Duration::from_millis(100), alice.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let store = seeded_store("s1", &sheet(&[&["A"]])).await;
        let hub = Hub::spawn(16);
        let (server, mut peer) = socket_pair().await;
        let endpoint = Endpoint::start(server, EndpointParams::new("s1", 1), store, hub.clone())
            .await
            .unwrap();
        next_server_frame(&mut peer).await;

        peer.close(None).await.unwrap();
        timeout(Duration::from_secs(2), endpoint.join()).await.unwrap();
        assert_eq!(hub.room_size("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_close_is_idempotent() {
        let store = seeded_store("s1", &sheet(&[&["A"]])).await;
        let hub = Hub::spawn(16);
        let (server, mut peer) = socket_pair().await;
        let endpoint = Endpoint::start(server, EndpointParams::new("s1", 1), store, hub)
            .await
            .unwrap();
        next_server_frame(&mut peer).await;

        assert!(endpoint.close(CloseReason::SlowConsumer));
        assert!(!endpoint.close(CloseReason::ConnectionFault));
        assert_eq!(endpoint.state(), ConnectionState::Closed);

        expect_close(&mut peer, CloseCode::Policy, CloseReason::SlowConsumer.message()).await;
        // Exactly one close frame: the stream ends after it.
        match timeout(Duration::from_secs(2), peer.next()).await.unwrap() {
            None | Some(Err(_)) => {}
            Some(Ok(frame)) => panic!("unexpected frame after close: {frame:?}"),
        }
        timeout(Duration::from_secs(2), endpoint.join()).await.unwrap();
    }

    /// Memory-backed reads, failing writes.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
    }

    impl SessionBackend for FlakyBackend {
        async fn field_count(&self, key: &str) -> Result<usize, StoreError> {
            self.inner.field_count(key).await
        }

        async fn set_all_with_ttl(
            &self,
            key: &str,
            fields: Vec<(String, String)>,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.inner.set_all_with_ttl(key, fields, ttl).await
        }

        async fn set_field(&self, _key: &str, _field: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only replica".into()))
        }

        async fn get_all(&self, key: &str) -> Result<std::collections::HashMap<String, String>, StoreError> {
            self.inner.get_all(key).await
        }
    }
}
