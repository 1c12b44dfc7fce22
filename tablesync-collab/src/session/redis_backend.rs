//! Redis-backed sessions: one hash per sheet.
//!
//! - `HLEN`   : existence check
//! - `MULTI HSET … PEXPIRE … EXEC`: seeding (atomic)
//! - `HSET`   : single cell edit
//! - `HGETALL`: snapshot fetch

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{SessionBackend, StoreError};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Session backend over a multiplexed Redis connection. Cheap to clone.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl RedisBackend {
    /// Connect and verify the server round-trips a value.
    ///
    /// `url` is a `redis://[:password@]host:port/db` connection string.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        log::debug!("Redis answered {pong} at {url}");

        let check_key = format!("tablesync-check-{}", Uuid::new_v4());
        let () = conn.set_ex(&check_key, "value", 1).await?;
        let echoed: Option<String> = conn.get(&check_key).await?;
        if echoed.as_deref() != Some("value") {
            return Err(StoreError::Backend(format!(
                "redis value mismatch for check key {check_key}: got {echoed:?}"
            )));
        }

        log::info!("Connected to redis");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

impl SessionBackend for RedisBackend {
    async fn field_count(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let count: usize = conn.hlen(key).await?;
        Ok(count)
    }

    async fn set_all_with_ttl(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            // HSET needs at least one field; an empty sheet has no session.
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let () = redis::pipe()
            .atomic()
            .hset_multiple(key, &fields)
            .ignore()
            .pexpire(key, ttl_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }
}
