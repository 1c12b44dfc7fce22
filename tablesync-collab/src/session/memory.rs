//! Process-local session backend.
//!
//! Same semantics as the remote store: one field map per key, whole-key
//! expiry checked lazily on access, and single-field writes that leave the
//! expiry alone (a write to an expired key starts a fresh key with no
//! expiry). Used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{SessionBackend, StoreError};

#[derive(Debug, Default)]
struct Entry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory hash storage with per-key expiry. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live for `key`, `None` if it has no expiry or is absent.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Drop every expired key. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }
}

impl SessionBackend for MemoryBackend {
    async fn field_count(&self, key: &str) -> Result<usize, StoreError> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map_or(0, |e| e.fields.len()))
    }

    async fn set_all_with_ttl(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let entry = entries.entry(key.to_string()).or_default();
        if entry.is_expired(now) {
            *entry = Entry::default();
        }
        entry.fields.extend(fields);
        entry.expires_at = Some(now + ttl);
        Ok(())
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let entry = entries.entry(key.to_string()).or_default();
        if entry.is_expired(now) {
            *entry = Entry::default();
        }
        entry.fields.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.fields.clone())
            .unwrap_or_default())
    }
}
