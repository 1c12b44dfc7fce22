//! Ephemeral, TTL-bound session storage for sheets under collaboration.
//!
//! ```text
//! ┌──────────────┐  exists / initialize / apply / fetch  ┌────────────────┐
//! │ SessionStore │ ─────────────────────────────────────► │ SessionBackend │
//! │ (timeouts,   │                                        │ redis | memory │
//! │  header rule)│ ◄───────────────────────────────────── │ hash per sheet │
//! └──────────────┘         field map "row:col" → data     └────────────────┘
//! ```
//!
//! One hash per sheet, keyed by sheet ID. Every call is bounded by a short
//! timeout; a timeout or backend failure is returned to the caller and never
//! retried here.

pub mod memory;
pub mod redis_backend;

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::coords;
use crate::matrix::{self, Matrix};
use crate::protocol::Edit;

pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;

/// Sessions outlive the sheet deadline by this much.
pub const SESSION_GRACE: Duration = Duration::from_secs(5 * 60);

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The edit targets the header row.
    #[error("cannot edit column headers")]
    InvalidEdit,
    /// The backend did not answer within the call's budget.
    #[error("session store timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered with an error.
    #[error("session store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Timeouts and backend failures: the store is unavailable right now.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Backend(_))
    }
}

/// Remote hash-map storage: one hash per key, per-key expiry.
///
/// Implementations must make `set_all_with_ttl` atomic: all fields and the
/// expiry land together or not at all.
pub trait SessionBackend: Send + Sync + 'static {
    /// Number of fields stored under `key` (0 if absent or expired).
    fn field_count(&self, key: &str) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Set `fields` under `key` and expire the whole key after `ttl`.
    fn set_all_with_ttl(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Set one field. Leaves the key's expiry as it is.
    fn set_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every field stored under `key`.
    fn get_all(&self, key: &str) -> impl Future<Output = Result<HashMap<String, String>, StoreError>> + Send;
}

/// Per-call time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeouts {
    pub exists: Duration,
    pub initialize: Duration,
    pub apply: Duration,
    pub fetch: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            exists: Duration::from_secs(2),
            initialize: Duration::from_secs(5),
            apply: Duration::from_secs(2),
            fetch: Duration::from_secs(3),
        }
    }
}

/// Session operations over a backend.
pub struct SessionStore<B> {
    backend: B,
    timeouts: StoreTimeouts,
    grace: Duration,
}

impl<B: SessionBackend> SessionStore<B> {
    pub fn new(backend: B) -> Self {
        Self::with_timeouts(backend, StoreTimeouts::default())
    }

    pub fn with_timeouts(backend: B, timeouts: StoreTimeouts) -> Self {
        Self {
            backend,
            timeouts,
            grace: SESSION_GRACE,
        }
    }

    /// Override the post-deadline grace window.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether the sheet has at least one cell in the store.
    ///
    /// Expired and never-created sessions both read as `false`.
    pub async fn exists(&self, sheet_id: &str) -> Result<bool, StoreError> {
        let count = bounded(self.timeouts.exists, self.backend.field_count(sheet_id))
            .await
            .inspect_err(|e| log::error!("Failed to check session for sheet {sheet_id}: {e}"))?;
        Ok(count > 0)
    }

    /// Seed the session from a dense matrix and set its expiry, atomically.
    ///
    /// The expiry is `deadline + grace` from now. Existing contents are
    /// overwritten; callers check [`exists`](Self::exists) first.
    pub async fn initialize(
        &self,
        sheet_id: &str,
        deadline: SystemTime,
        data: &Matrix,
    ) -> Result<(), StoreError> {
        let ttl = session_ttl(deadline, self.grace, SystemTime::now());
        let fields = matrix::flatten(data);
        let cell_count = fields.len();

        bounded(
            self.timeouts.initialize,
            self.backend.set_all_with_ttl(sheet_id, fields, ttl),
        )
        .await
        .inspect_err(|e| log::error!("Failed to initialize session for sheet {sheet_id}: {e}"))?;

        log::info!("Initialized session for sheet {sheet_id}: {cell_count} cells, ttl {ttl:?}");
        Ok(())
    }

    /// Write one cell. `edit.row` is in store coordinates (header at 0).
    pub async fn apply_edit(&self, sheet_id: &str, edit: &Edit) -> Result<(), StoreError> {
        if edit.row == 0 {
            return Err(StoreError::InvalidEdit);
        }

        let field = coords::encode(edit.row, edit.col);
        bounded(
            self.timeouts.apply,
            self.backend.set_field(sheet_id, &field, &edit.data),
        )
        .await
        .inspect_err(|e| log::error!("Failed to apply edit {field} to sheet {sheet_id}: {e}"))
    }

    /// The sheet's full sparse cell map (empty if there is no session).
    pub async fn get_all(&self, sheet_id: &str) -> Result<HashMap<String, String>, StoreError> {
        bounded(self.timeouts.fetch, self.backend.get_all(sheet_id))
            .await
            .inspect_err(|e| log::error!("Failed to fetch session data for sheet {sheet_id}: {e}"))
    }
}

/// Time left until `deadline + grace`, or zero if that moment has passed.
pub fn session_ttl(deadline: SystemTime, grace: Duration, now: SystemTime) -> Duration {
    (deadline + grace).duration_since(now).unwrap_or_default()
}

async fn bounded<T, F>(budget: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(budget)),
    }
}
