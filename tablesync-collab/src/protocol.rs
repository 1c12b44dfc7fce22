//! JSON wire protocol spoken over the sheet WebSocket.
//!
//! ```text
//! server → client  (once)     [["Name","Email"],["ada","ada@example.com"]]
//! client → server  (edits)    {"row":0,"col":1,"data":"ada@example.org"}
//! server → client  (edits)    {"row":0,"col":1,"data":"ada@example.org"}
//! server → client  (refusal)  {"type":"error","msg":"..."}  then close
//! ```
//!
//! Edit rows on the wire are header-relative: row 0 is the first data row.
//! The session store numbers rows with the header at index 0, see
//! [`Edit::to_store_row`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::matrix::Matrix;

/// A single cell's new value. Last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub row: usize,
    pub col: usize,
    pub data: String,
}

impl Edit {
    pub fn new(row: usize, col: usize, data: impl Into<String>) -> Self {
        Self {
            row,
            col,
            data: data.into(),
        }
    }

    /// Shift a header-relative edit into store coordinates (header at row 0).
    ///
    /// Returns `None` when the row cannot be shifted without overflowing.
    pub fn to_store_row(&self) -> Option<Edit> {
        let row = self.row.checked_add(1)?;
        Some(Edit {
            row,
            col: self.col,
            data: self.data.clone(),
        })
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Refusal payload sent before closing a connection that never joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: String,
}

impl ErrorMessage {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            msg: msg.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Anything the server may send, as seen by a client.
///
/// Untagged: the snapshot is a JSON array, refusals carry `type`, edits
/// carry `row`/`col`/`data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Snapshot(Matrix),
    Error(ErrorMessage),
    Edit(Edit),
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

pub fn encode_snapshot(matrix: &Matrix) -> Result<String, ProtocolError> {
    serde_json::to_string(matrix).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Why the server is closing a joined connection.
///
/// Each reason maps to a close code and a short user-facing sentence that
/// travels in the close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed, or the server is tearing down without complaint.
    Normal,
    /// An inbound frame was not a valid edit.
    UnreadableEdit,
    /// The edit targeted the header row.
    HeaderEdit,
    /// The session store rejected or timed out on an edit.
    EditNotSaved,
    /// The initial snapshot could not be produced.
    SnapshotUnavailable,
    /// The connection could not keep up with broadcast edits.
    SlowConsumer,
    /// A read or write on the socket failed.
    ConnectionFault,
    /// The hub is gone; the server is going down.
    ServerShutdown,
}

impl CloseReason {
    pub fn code(&self) -> CloseCode {
        match self {
            CloseReason::Normal => CloseCode::Normal,
            CloseReason::UnreadableEdit => CloseCode::Invalid,
            CloseReason::HeaderEdit => CloseCode::Policy,
            CloseReason::EditNotSaved => CloseCode::Again,
            CloseReason::SnapshotUnavailable => CloseCode::Again,
            CloseReason::SlowConsumer => CloseCode::Policy,
            CloseReason::ConnectionFault => CloseCode::Error,
            CloseReason::ServerShutdown => CloseCode::Away,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CloseReason::Normal => "",
            CloseReason::UnreadableEdit => "server was unable to read your edits",
            CloseReason::HeaderEdit => "column headers cannot be edited",
            CloseReason::EditNotSaved => "server was unable to save your edit, please try again later",
            CloseReason::SnapshotUnavailable => "server was unable to load the sheet, please try again later",
            CloseReason::SlowConsumer => "connection too slow to keep up with edits",
            CloseReason::ConnectionFault => "connection error",
            CloseReason::ServerShutdown => "server is shutting down",
        }
    }

    /// The close frame announcing this reason.
    pub fn frame(&self) -> Message {
        Message::Close(Some(CloseFrame {
            code: self.code(),
            reason: self.message().into(),
        }))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Rejected by server: {0}")]
    Rejected(String),
    #[error("WebSocket error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_wire_shape() {
        let edit = Edit::new(3, 1, "hello");
        assert_eq!(edit.encode().unwrap(), r#"{"row":3,"col":1,"data":"hello"}"#);
        assert_eq!(Edit::decode(r#"{"row":3,"col":1,"data":"hello"}"#).unwrap(), edit);
    }

    #[test]
    fn test_edit_rejects_negative_and_missing_fields() {
        assert!(Edit::decode(r#"{"row":-1,"col":0,"data":"x"}"#).is_err());
        assert!(Edit::decode(r#"{"row":1,"data":"x"}"#).is_err());
        assert!(Edit::decode(r#"{"row":"1","col":0,"data":"x"}"#).is_err());
        assert!(Edit::decode("not json").is_err());
    }

    #[test]
    fn test_edit_data_is_opaque() {
        let edit = Edit::decode(r#"{"row":0,"col":0,"data":"=SUM(A1:A3) \"quoted\""}"#).unwrap();
        assert_eq!(edit.data, "=SUM(A1:A3) \"quoted\"");
    }

    #[test]
    fn test_store_row_shift() {
        let edit = Edit::new(0, 2, "x");
        let shifted = edit.to_store_row().unwrap();
        assert_eq!(shifted.row, 1);
        assert_eq!(shifted.col, 2);
        assert_eq!(edit.row, 0, "input edit is left untouched");
        assert!(Edit::new(usize::MAX, 0, "x").to_store_row().is_none());
    }

    #[test]
    fn test_error_message_shape() {
        let msg = ErrorMessage::new("The deadline to edit this sheet has passed.");
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"type":"error","msg":"The deadline to edit this sheet has passed."}"#
        );
    }

    #[test]
    fn test_server_frame_variants() {
        assert_eq!(
            ServerFrame::decode(r#"[["Name"],["ada"]]"#).unwrap(),
            ServerFrame::Snapshot(vec![vec!["Name".into()], vec!["ada".into()]])
        );
        assert_eq!(
            ServerFrame::decode(r#"{"type":"error","msg":"nope"}"#).unwrap(),
            ServerFrame::Error(ErrorMessage::new("nope"))
        );
        assert_eq!(
            ServerFrame::decode(r#"{"row":0,"col":0,"data":"a"}"#).unwrap(),
            ServerFrame::Edit(Edit::new(0, 0, "a"))
        );
        assert!(ServerFrame::decode(r#"{"hello":1}"#).is_err());
    }

    #[test]
    fn test_close_reasons_fit_in_frame() {
        // Close frame payloads are capped at 125 bytes, two of which are the code.
        for reason in [
            CloseReason::Normal,
            CloseReason::UnreadableEdit,
            CloseReason::HeaderEdit,
            CloseReason::EditNotSaved,
            CloseReason::SnapshotUnavailable,
            CloseReason::SlowConsumer,
            CloseReason::ConnectionFault,
            CloseReason::ServerShutdown,
        ] {
            assert!(reason.message().len() <= 123, "{reason:?}");
        }
        assert_eq!(CloseReason::HeaderEdit.code(), CloseCode::Policy);
    }
}
