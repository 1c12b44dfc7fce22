//! WebSocket client for a sheet edit session.
//!
//! Connecting waits for the server's first frame: a snapshot admits the
//! client, an error payload means it was turned away. After that, edits
//! from other collaborators and the final close arrive as [`SheetEvent`]s.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::matrix::Matrix;
use crate::protocol::{Edit, ProtocolError, ServerFrame};

const CHANNEL_CAPACITY: usize = 256;

/// Close code and reason sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: CloseCode,
    pub reason: String,
}

impl From<CloseFrame> for CloseInfo {
    fn from(frame: CloseFrame) -> Self {
        Self {
            code: frame.code,
            reason: frame.reason.as_str().to_string(),
        }
    }
}

/// Events emitted after the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetEvent {
    /// Another collaborator's edit, header-relative row
    Edit(Edit),
    /// An error payload from the server
    Error(String),
    /// The connection ended; `None` if no close frame was received
    Closed(Option<CloseInfo>),
}

/// `ws://host:port` plus the sheet's edit path.
pub fn sheet_url(server_url: &str, sheet_id: &str) -> String {
    format!("{}/ws/sheet/{sheet_id}/edit/", server_url.trim_end_matches('/'))
}

/// A joined edit session.
pub struct SheetClient {
    sheet_id: String,
    snapshot: Matrix,
    outgoing_tx: mpsc::Sender<Message>,
    event_rx: mpsc::Receiver<SheetEvent>,
}

impl SheetClient {
    /// Connect and wait for the initial snapshot.
    ///
    /// Returns [`ProtocolError::Rejected`] if the server answers with an
    /// error payload instead.
    pub async fn connect(server_url: &str, sheet_id: &str) -> Result<Self, ProtocolError> {
        let url = sheet_url(server_url, sheet_id);
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;

        let snapshot = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match ServerFrame::decode(text.as_str())? {
                    ServerFrame::Snapshot(matrix) => break matrix,
                    ServerFrame::Error(err) => return Err(ProtocolError::Rejected(err.msg)),
                    ServerFrame::Edit(_) => {
                        return Err(ProtocolError::UnexpectedFrame("edit before snapshot".into()))
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ProtocolError::Transport(e.to_string())),
            }
        };
        log::debug!("Joined sheet {sheet_id} with {} rows", snapshot.len());

        let (mut ws_writer, mut ws_reader) = ws.split();

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(msg).await {
                    log::debug!("Client write failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: server frames to events
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut close_seen = false;
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(ServerFrame::Edit(edit)) => SheetEvent::Edit(edit),
                        Ok(ServerFrame::Error(err)) => SheetEvent::Error(err.msg),
                        Ok(ServerFrame::Snapshot(_)) => {
                            log::warn!("Ignoring repeated snapshot");
                            continue;
                        }
                        Err(e) => {
                            log::warn!("Ignoring unreadable frame: {e}");
                            continue;
                        }
                    },
                    // Keep reading so the close handshake completes.
                    Ok(Message::Close(frame)) => {
                        close_seen = true;
                        SheetEvent::Closed(frame.map(CloseInfo::from))
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("Client read failed: {e}");
                        break;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            if !close_seen {
                let _ = event_tx.send(SheetEvent::Closed(None)).await;
            }
        });

        Ok(Self {
            sheet_id: sheet_id.to_string(),
            snapshot,
            outgoing_tx,
            event_rx,
        })
    }

    pub fn sheet_id(&self) -> &str {
        &self.sheet_id
    }

    /// The sheet as it was when this client joined, header row first.
    pub fn snapshot(&self) -> &Matrix {
        &self.snapshot
    }

    /// Send an edit. `edit.row` is header-relative.
    pub async fn send_edit(&self, edit: &Edit) -> Result<(), ProtocolError> {
        self.send_text(edit.encode()?).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(Message::text(text.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Next event, or `None` once the connection is gone and every event
    /// has been read.
    pub async fn next_event(&mut self) -> Option<SheetEvent> {
        self.event_rx.recv().await
    }

    /// Start a normal close.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(Message::Close(None))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
