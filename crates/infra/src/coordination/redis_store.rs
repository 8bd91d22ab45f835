//! Redis-backed coordination store (`SET key 1 NX PX ttl`, `PEXPIRE`, `DEL key`).

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::instrument;

use super::{CoordinationError, CoordinationStore};

#[derive(Clone)]
pub struct RedisCoordinationStore {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinationStore").finish_non_exhaustive()
    }
}

impl RedisCoordinationStore {
    /// Open a multiplexed connection to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CoordinationError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoordinationError::Unavailable(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait::async_trait]
impl CoordinationStore for RedisCoordinationStore {
    #[instrument(skip(self), err)]
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordinationError::Command(e.to_string()))?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self), err)]
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let mut conn = self.conn.clone();
        let touched: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordinationError::Command(e.to_string()))?;
        Ok(touched == 1)
    }

    #[instrument(skip(self), err)]
    async fn release(&self, key: &str) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordinationError::Command(e.to_string()))?;
        Ok(())
    }
}
