//! # tablesync-collab: Real-time collaborative sheet editing
//!
//! Several people edit the same sheet at once over WebSockets. Each edit is
//! written to a shared session store, then fanned out to everyone else on
//! that sheet. A newcomer gets the whole sheet first, then live edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SheetClient │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (admission) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │  Endpoint   │ one per connection
//!                                     └──┬───────┬──┘
//!                                        │       │
//!                              ┌─────────┴──┐ ┌──┴──────────┐
//!                              │SessionStore│ │     Hub     │
//!                              │ "row:col"  │ │  (fan-out)  │
//!                              └────────────┘ └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`coords`]: `"row:col"` cell keys
//! - [`matrix`]: sparse cell map ↔ dense rows
//! - [`protocol`]: JSON wire frames and close reasons
//! - [`session`]: expiring per-sheet cell store (Redis or in-memory)
//! - [`hub`]: sheet-scoped broadcast with slow-consumer eviction
//! - [`endpoint`]: one connection's read and write loops
//! - [`documents`]: durable sheet records consulted at admission
//! - [`server`]: WebSocket server and admission checks
//! - [`client`]: WebSocket client

pub mod coords;
pub mod matrix;
pub mod protocol;
pub mod session;
pub mod hub;
pub mod endpoint;
pub mod documents;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use coords::{CellKey, CoordError};
pub use matrix::Matrix;
pub use protocol::{CloseReason, Edit, ErrorMessage, ProtocolError, ServerFrame};
pub use session::{
    MemoryBackend, RedisBackend, SessionBackend, SessionStore, StoreError, StoreTimeouts,
};
pub use hub::{BroadcastMessage, EndpointHandle, EndpointId, Hub, HubClosed, HubHandle, HubStats};
pub use endpoint::{ConnectionState, Endpoint, EndpointParams, Shutdown};
pub use documents::{DocumentRepository, InMemoryRepository, RepositoryError, SheetRecord};
pub use server::{Rejection, ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{CloseInfo, SheetClient, SheetEvent};
