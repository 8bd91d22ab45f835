//! Outbox publisher: polls unpublished rows and hands them to a dispatcher.
//!
//! - Rows are dispatched in `id` order
//! - A failed dispatch is recorded on its row and the batch moves on to the next row
//! - Malformed payloads, and rows that have failed `max_attempts` polls, are dead-lettered
//! - A closed dispatch target stops the batch, since no later row can get through either
//! - Fetch errors back off linearly (1s per consecutive error, capped)
//! - `PublisherHandle::shutdown` cancels the loop and waits for it to exit

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::OutboxStore;
use super::types::{JobDispatch, OutboxMessage, TOPIC_JOB_CREATED};
use crate::jobs::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch target closed")]
    Closed,

    #[error("malformed outbox payload: {0}")]
    Payload(String),

    #[error("dispatch failed: {0}")]
    Failed(String),
}

/// Destination of published outbox messages.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: &OutboxMessage) -> Result<(), DispatchError>;
}

/// Feeds `jobs.created` messages to the orchestrator worker's queue.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<JobDispatch>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<JobDispatch>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, message: &OutboxMessage) -> Result<(), DispatchError> {
        if message.topic != TOPIC_JOB_CREATED {
            debug!(topic = %message.topic, id = message.id, "no consumer for topic; skipping");
            return Ok(());
        }
        let dispatch: JobDispatch = serde_json::from_value(message.payload.clone())
            .map_err(|e| DispatchError::Payload(e.to_string()))?;
        self.tx.send(dispatch).await.map_err(|_| DispatchError::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub name: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_error_backoff: Duration,
    /// Per-message retry before the batch gives up on it.
    pub dispatch_retry: RetryPolicy,
    /// Failed polls after which a row is dead-lettered.
    pub max_attempts: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            name: "outbox-publisher".to_string(),
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            max_error_backoff: Duration::from_secs(30),
            dispatch_retry: RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(2)),
            max_attempts: 5,
        }
    }
}

impl PublisherConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_dispatch_retry(mut self, policy: RetryPolicy) -> Self {
        self.dispatch_retry = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Counters exposed by a running publisher.
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub published: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub fetch_errors: AtomicU64,
}

impl PublisherStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn fetch_errors(&self) -> u64 {
        self.fetch_errors.load(Ordering::Relaxed)
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub published: usize,
    /// Rows that failed and stay pending for the next poll.
    pub failed: Vec<i64>,
    pub dead_lettered: Vec<i64>,
    /// Id of the message the batch stopped at, if any.
    pub stalled_at: Option<i64>,
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    dispatcher: Arc<dyn Dispatcher>,
    config: PublisherConfig,
    stats: Arc<PublisherStats>,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, dispatcher: Arc<dyn Dispatcher>, config: PublisherConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
            stats: Arc::new(PublisherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        Arc::clone(&self.stats)
    }

    /// Fetch one batch and publish it in order.
    ///
    /// Returns `Err` only when the fetch itself fails. A failed dispatch is
    /// recorded on its row and skipped; a closed target or a failed mark
    /// stops the batch and is reported through `stalled_at`.
    pub async fn publish_batch(&self) -> Result<BatchReport, crate::StoreError> {
        let messages = self.store.fetch_unpublished(self.config.batch_size).await?;
        let mut report = BatchReport {
            fetched: messages.len(),
            ..BatchReport::default()
        };

        for message in &messages {
            if let Err(err) = self.dispatch_with_retry(message).await {
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                let closed = err == DispatchError::Closed;
                self.record_failure(message, &err, &mut report).await;
                if closed {
                    report.stalled_at = Some(message.id);
                    break;
                }
                continue;
            }
            if let Err(err) = self.store.mark_published(message.id).await {
                // Dispatched but not marked: it will be dispatched again.
                warn!(publisher = %self.config.name, id = message.id, error = %err, "mark published failed");
                report.stalled_at = Some(message.id);
                break;
            }
            self.stats.published.fetch_add(1, Ordering::Relaxed);
            report.published += 1;
        }

        if report.published > 0 {
            debug!(publisher = %self.config.name, published = report.published, "outbox batch published");
        }
        Ok(report)
    }

    async fn record_failure(&self, message: &OutboxMessage, err: &DispatchError, report: &mut BatchReport) {
        // A closed target says nothing about the row, so it never retires it.
        let dead_letter = match err {
            DispatchError::Payload(_) => true,
            DispatchError::Closed => false,
            DispatchError::Failed(_) => message.attempts.saturating_add(1) >= self.config.max_attempts,
        };
        let attempts = match self.store.record_failure(message.id, &err.to_string(), dead_letter).await {
            Ok(attempts) => attempts,
            Err(store_err) => {
                warn!(publisher = %self.config.name, id = message.id, error = %store_err, "failed to record dispatch failure");
                report.failed.push(message.id);
                return;
            }
        };

        if dead_letter {
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            report.dead_lettered.push(message.id);
            error!(
                publisher = %self.config.name,
                id = message.id,
                topic = %message.topic,
                attempts,
                error = %err,
                "outbox message dead-lettered"
            );
        } else {
            report.failed.push(message.id);
            warn!(
                publisher = %self.config.name,
                id = message.id,
                topic = %message.topic,
                attempts,
                error = %err,
                "dispatch failed"
            );
        }
    }

    async fn dispatch_with_retry(&self, message: &OutboxMessage) -> Result<(), DispatchError> {
        let policy = &self.config.dispatch_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatcher.dispatch(message).await {
                Ok(()) => return Ok(()),
                // Neither gets better by waiting.
                Err(err @ (DispatchError::Closed | DispatchError::Payload(_))) => return Err(err),
                Err(err) if !policy.should_retry(attempt) => return Err(err),
                Err(err) => {
                    debug!(id = message.id, attempt, error = %err, "dispatch attempt failed");
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    /// Start the polling loop on the current runtime.
    pub fn spawn(self) -> PublisherHandle {
        let token = CancellationToken::new();
        let stats = self.stats();
        let loop_token = token.clone();
        let join = tokio::spawn(async move { self.run(loop_token).await });
        PublisherHandle { token, join, stats }
    }

    async fn run(self, token: CancellationToken) {
        info!(
            publisher = %self.config.name,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox publisher started"
        );
        let mut consecutive_errors: u32 = 0;

        loop {
            let wait = match self.publish_batch().await {
                Ok(report) => {
                    consecutive_errors = 0;
                    // A full clean batch likely means more is waiting.
                    if report.stalled_at.is_none() && report.failed.is_empty() && report.fetched == self.config.batch_size {
                        Duration::ZERO
                    } else {
                        self.config.poll_interval
                    }
                }
                Err(err) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                    let backoff = Duration::from_secs(u64::from(consecutive_errors)).min(self.config.max_error_backoff);
                    error!(
                        publisher = %self.config.name,
                        error = %err,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "failed to fetch outbox messages"
                    );
                    backoff
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(publisher = %self.config.name, "outbox publisher stopped");
    }
}

/// Handle to control and join a running publisher.
#[derive(Debug)]
pub struct PublisherHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<PublisherStats>,
}

impl PublisherHandle {
    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "outbox publisher task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobStore, NewJob};
    use beacon_core::JobId;
    use std::sync::Mutex;

    async fn seed(store: &InMemoryJobStore, ids: &[&str]) {
        for id in ids {
            let job_id = JobId::parse(*id).unwrap();
            store
                .create_job(NewJob {
                    id: job_id.clone(),
                    spec: Default::default(),
                    idempotency_key: None,
                    outbox_topic: TOPIC_JOB_CREATED.into(),
                    outbox_payload: JobDispatch::created(job_id).to_payload(),
                })
                .await
                .unwrap();
        }
    }

    /// Records dispatched ids and fails for the configured jobs.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<i64>>,
        fail_job: Option<String>,
        malformed_job: Option<String>,
    }

    #[async_trait::async_trait]
    impl Dispatcher for Recording {
        async fn dispatch(&self, message: &OutboxMessage) -> Result<(), DispatchError> {
            let job = message.payload["job_id"].as_str();
            if self.fail_job.is_some() && self.fail_job.as_deref() == job {
                return Err(DispatchError::Failed("broker down".into()));
            }
            if self.malformed_job.is_some() && self.malformed_job.as_deref() == job {
                return Err(DispatchError::Payload("missing field `job_id`".into()));
            }
            self.seen.lock().unwrap().push(message.id);
            Ok(())
        }
    }

    fn config() -> PublisherConfig {
        PublisherConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_dispatch_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn batch_publishes_in_id_order() {
        let store = InMemoryJobStore::arc();
        seed(&store, &["a", "b", "c"]).await;
        let dispatcher = Arc::new(Recording::default());
        let publisher = OutboxPublisher::new(store.clone(), dispatcher.clone(), config());

        let report = publisher.publish_batch().await.unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(*dispatcher.seen.lock().unwrap(), vec![1, 2, 3]);
        assert!(store.fetch_unpublished(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_row_is_recorded_and_later_rows_still_go_out() {
        let store = InMemoryJobStore::arc();
        seed(&store, &["a", "b", "c"]).await;
        let dispatcher = Arc::new(Recording {
            fail_job: Some("b".into()),
            ..Recording::default()
        });
        let publisher = OutboxPublisher::new(store.clone(), dispatcher.clone(), config().with_max_attempts(2));

        let report = publisher.publish_batch().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(report.failed, vec![2]);
        assert_eq!(report.stalled_at, None);
        assert_eq!(*dispatcher.seen.lock().unwrap(), vec![1, 3]);

        let pending = store.fetch_unpublished(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 2);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("dispatch failed: broker down"));

        // Second failing poll reaches max_attempts.
        let report = publisher.publish_batch().await.unwrap();
        assert_eq!(report.dead_lettered, vec![2]);
        assert!(store.fetch_unpublished(10).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().dead_lettered, 1);
        assert_eq!(publisher.stats().dispatch_failures(), 2);
        assert_eq!(publisher.stats().dead_lettered(), 1);
    }

    #[tokio::test]
    async fn malformed_row_is_dead_lettered_without_blocking_the_next() {
        let store = InMemoryJobStore::arc();
        seed(&store, &["poison", "good"]).await;
        let dispatcher = Arc::new(Recording {
            malformed_job: Some("poison".into()),
            ..Recording::default()
        });
        let publisher = OutboxPublisher::new(store.clone(), dispatcher.clone(), config());

        let report = publisher.publish_batch().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.dead_lettered, vec![1]);
        assert_eq!(*dispatcher.seen.lock().unwrap(), vec![2]);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.unpublished, 0);
        assert_eq!(stats.dead_lettered, 1);

        // Nothing left to retry on the next poll.
        assert_eq!(publisher.publish_batch().await.unwrap(), BatchReport::default());
    }

    #[tokio::test]
    async fn closed_target_stops_the_batch_without_retiring_rows() {
        let store = InMemoryJobStore::arc();
        seed(&store, &["a", "b"]).await;
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let publisher = OutboxPublisher::new(store.clone(), Arc::new(ChannelDispatcher::new(tx)), config());

        let report = publisher.publish_batch().await.unwrap();
        assert_eq!(report.stalled_at, Some(1));
        assert_eq!(report.failed, vec![1]);

        let pending = store.fetch_unpublished(10).await.unwrap();
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(pending[1].attempts, 0);
    }

    #[tokio::test]
    async fn channel_dispatcher_forwards_job_ids() {
        let (tx, mut rx) = mpsc::channel(4);
        let dispatcher = ChannelDispatcher::new(tx);
        let message = OutboxMessage::new(
            1,
            TOPIC_JOB_CREATED,
            JobDispatch::created(JobId::parse("job-7").unwrap()).to_payload(),
            chrono::Utc::now(),
        );

        dispatcher.dispatch(&message).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().job_id.as_str(), "job-7");

        drop(rx);
        assert_eq!(dispatcher.dispatch(&message).await, Err(DispatchError::Closed));
    }

    #[tokio::test]
    async fn spawned_publisher_drains_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        seed(&store, &["a", "b"]).await;
        let (tx, mut rx) = mpsc::channel(8);
        let handle = OutboxPublisher::new(store.clone(), Arc::new(ChannelDispatcher::new(tx)), config()).spawn();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.job_id.as_str(), "a");
        assert_eq!(second.job_id.as_str(), "b");

        handle.shutdown().await;
        assert_eq!(store.stats().await.unwrap().unpublished, 0);
    }
}
