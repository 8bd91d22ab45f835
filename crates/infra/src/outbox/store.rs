//! Outbox storage.

use chrono::Utc;

use super::types::{OutboxMessage, OutboxStats};
use crate::error::StoreError;
use crate::jobs::InMemoryJobStore;

/// Read/mark side of the outbox. Rows are only ever inserted by `JobStore`.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` unpublished, non-dead-lettered rows, lowest id first.
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Stamp `published_at`. Marking an already-published row is a no-op.
    async fn mark_published(&self, id: i64) -> Result<(), StoreError>;

    /// Bump the row's attempt counter and keep `error` as its last error.
    /// With `dead_letter` set the row is also retired from `fetch_unpublished`.
    /// Returns the attempt count after the bump.
    async fn record_failure(&self, id: i64, error: &str, dead_letter: bool) -> Result<u32, StoreError>;

    async fn stats(&self) -> Result<OutboxStats, StoreError>;
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryJobStore {
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        Ok(state
            .outbox
            .iter()
            .filter(|m| m.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: i64) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        let message = usize::try_from(id - 1)
            .ok()
            .and_then(|idx| state.outbox.get_mut(idx))
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {id}")))?;
        if message.published_at.is_none() {
            message.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str, dead_letter: bool) -> Result<u32, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        let message = usize::try_from(id - 1)
            .ok()
            .and_then(|idx| state.outbox.get_mut(idx))
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {id}")))?;
        message.attempts = message.attempts.saturating_add(1);
        message.last_error = Some(error.to_string());
        if dead_letter && message.dead_lettered_at.is_none() {
            message.dead_lettered_at = Some(Utc::now());
        }
        Ok(message.attempts)
    }

    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        let dead_lettered = state.outbox.iter().filter(|m| m.dead_lettered_at.is_some()).count() as u64;
        let mut pending = state.outbox.iter().filter(|m| m.is_pending());
        let oldest = pending.next();
        let unpublished = oldest.map(|_| 1 + pending.count() as u64).unwrap_or(0);
        let age = oldest
            .map(|m| (Utc::now() - m.created_at).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        Ok(OutboxStats {
            unpublished,
            oldest_unpublished_age_secs: age,
            dead_lettered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStore, NewJob};
    use beacon_core::JobId;
    use serde_json::json;

    async fn seed(store: &InMemoryJobStore, n: usize) {
        for i in 0..n {
            store
                .create_job(NewJob {
                    id: JobId::parse(format!("job-{i}")).unwrap(),
                    spec: Default::default(),
                    idempotency_key: None,
                    outbox_topic: "jobs.created".into(),
                    outbox_payload: json!({"job_id": format!("job-{i}")}),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn unpublished_rows_come_back_in_insertion_order() {
        let store = InMemoryJobStore::new();
        seed(&store, 3).await;
        store.mark_published(2).await.unwrap();

        let ids: Vec<i64> = store.fetch_unpublished(10).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(store.fetch_unpublished(1).await.unwrap()[0].id, 1);
    }

    #[tokio::test]
    async fn stats_report_backlog() {
        let store = InMemoryJobStore::new();
        assert_eq!(store.stats().await.unwrap(), OutboxStats::default());

        seed(&store, 2).await;
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.unpublished, 2);
        assert!(stats.oldest_unpublished_age_secs >= 0.0);
    }

    #[tokio::test]
    async fn failures_accumulate_until_the_row_is_dead_lettered() {
        let store = InMemoryJobStore::new();
        seed(&store, 2).await;

        assert_eq!(store.record_failure(1, "broker down", false).await.unwrap(), 1);
        assert_eq!(store.fetch_unpublished(10).await.unwrap()[0].last_error.as_deref(), Some("broker down"));

        assert_eq!(store.record_failure(1, "bad payload", true).await.unwrap(), 2);
        let ids: Vec<i64> = store.fetch_unpublished(10).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2]);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.unpublished, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn marking_unknown_row_is_not_found() {
        let store = InMemoryJobStore::new();
        assert!(matches!(store.mark_published(42).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.record_failure(42, "x", false).await, Err(StoreError::NotFound(_))));
    }
}
