//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use beacon_core::JobId;

use super::types::{CreateOutcome, JobRecord, JobStatus, NewJob, StuckCriteria, StuckJob, StuckJobStats};
use crate::error::StoreError;
use crate::outbox::OutboxMessage;

/// Job store abstraction.
///
/// `create_job` and `republish` write the job row and its outbox message
/// atomically; nothing else in the engine may insert outbox rows.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically: resolve the idempotency key, insert the job, enqueue its
    /// outbox message, and record the key (insert-if-absent).
    async fn create_job(&self, job: NewJob) -> Result<CreateOutcome, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<JobId>, StoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Set the job status. Moving to `running` stamps `started_at` once.
    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<(), StoreError>;

    /// If the job is still in `expected` status: reset it to `created`, clear
    /// `started_at`, and enqueue a new outbox message, all in one write.
    /// Returns `false` when the status moved on in the meantime.
    async fn republish(
        &self,
        id: &JobId,
        expected: JobStatus,
        topic: &str,
        payload: JsonValue,
    ) -> Result<bool, StoreError>;

    /// Jobs stuck in `created` or `running` per `criteria`, oldest first.
    async fn find_stuck(&self, criteria: &StuckCriteria) -> Result<Vec<StuckJob>, StoreError>;

    async fn stuck_stats(&self, criteria: &StuckCriteria) -> Result<StuckJobStats, StoreError>;
}

/// Shared state behind one lock so intake writes are atomic.
#[derive(Debug, Default)]
pub(crate) struct IntakeState {
    pub(crate) jobs: HashMap<JobId, JobRecord>,
    pub(crate) idempotency: HashMap<String, JobId>,
    /// Outbox rows; a row's id is its position + 1.
    pub(crate) outbox: Vec<OutboxMessage>,
}

impl IntakeState {
    pub(crate) fn enqueue(&mut self, topic: &str, payload: JsonValue, now: DateTime<Utc>) -> i64 {
        let id = self.outbox.len() as i64 + 1;
        self.outbox.push(OutboxMessage::new(id, topic, payload, now));
        id
    }
}

/// In-memory job + idempotency + outbox store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    pub(crate) state: RwLock<IntakeState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs.
    pub fn job_count(&self) -> usize {
        self.state.read().map(|s| s.jobs.len()).unwrap_or(0)
    }

    /// Rewrite a job's timestamps (tests simulate stuck jobs with this).
    #[cfg(test)]
    pub(crate) fn backdate(
        &self,
        id: &JobId,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.write().unwrap();
        let job = state.jobs.get_mut(id).unwrap();
        job.created_at = created_at;
        job.started_at = started_at;
    }
}

fn is_stuck(job: &JobRecord, criteria: &StuckCriteria) -> bool {
    match job.status {
        JobStatus::Created => job.created_at < criteria.created_before,
        JobStatus::Running => job
            .started_at
            .is_none_or(|started| started < criteria.started_before),
        _ => false,
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: NewJob) -> Result<CreateOutcome, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = state.idempotency.get(key) {
                return Ok(CreateOutcome {
                    job_id: existing.clone(),
                    created: false,
                });
            }
        }
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }

        let now = Utc::now();
        state.jobs.insert(
            job.id.clone(),
            JobRecord {
                id: job.id.clone(),
                spec: job.spec,
                status: JobStatus::Created,
                created_at: now,
                started_at: None,
                updated_at: now,
            },
        );
        state.enqueue(&job.outbox_topic, job.outbox_payload, now);
        if let Some(key) = job.idempotency_key {
            state.idempotency.insert(key, job.id.clone());
        }

        Ok(CreateOutcome {
            job_id: job.id,
            created: true,
        })
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<JobId>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        Ok(state.idempotency.get(key).cloned())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        Ok(state.jobs.get(id).cloned())
    }

    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;

        let now = Utc::now();
        if status == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        job.status = status;
        job.updated_at = now;
        Ok(())
    }

    async fn republish(
        &self,
        id: &JobId,
        expected: JobStatus,
        topic: &str,
        payload: JsonValue,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        let now = Utc::now();
        match state.jobs.get_mut(id) {
            Some(job) if job.status == expected => {
                job.status = JobStatus::Created;
                job.started_at = None;
                job.updated_at = now;
            }
            Some(_) => return Ok(false),
            None => return Err(StoreError::NotFound(format!("job {id}"))),
        }
        state.enqueue(topic, payload, now);
        Ok(true)
    }

    async fn find_stuck(&self, criteria: &StuckCriteria) -> Result<Vec<StuckJob>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        let mut stuck: Vec<StuckJob> = state
            .jobs
            .values()
            .filter(|job| is_stuck(job, criteria))
            .map(|job| StuckJob {
                id: job.id.clone(),
                status: job.status,
                created_at: job.created_at,
                started_at: job.started_at,
            })
            .collect();
        stuck.sort_by_key(|j| j.created_at);
        stuck.truncate(criteria.limit);
        Ok(stuck)
    }

    async fn stuck_stats(&self, criteria: &StuckCriteria) -> Result<StuckJobStats, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        let mut stats = StuckJobStats::default();
        for job in state.jobs.values().filter(|job| is_stuck(job, criteria)) {
            match (job.status, job.started_at) {
                (JobStatus::Created, _) => stats.stuck_created += 1,
                (JobStatus::Running, None) => stats.running_without_start += 1,
                (JobStatus::Running, Some(_)) => stats.running_too_long += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_jobspec::JobSpec;
    use serde_json::json;

    fn new_job(id: &str, key: Option<&str>) -> NewJob {
        NewJob {
            id: JobId::parse(id).unwrap(),
            spec: JobSpec::default(),
            idempotency_key: key.map(str::to_string),
            outbox_topic: "jobs.created".into(),
            outbox_payload: json!({"job_id": id}),
        }
    }

    fn criteria(now: DateTime<Utc>) -> StuckCriteria {
        StuckCriteria {
            created_before: now - chrono::Duration::minutes(10),
            started_before: now - chrono::Duration::minutes(30),
            limit: 100,
        }
    }

    #[tokio::test]
    async fn create_writes_job_outbox_and_key_together() {
        let store = InMemoryJobStore::new();
        let outcome = store.create_job(new_job("job-1", Some("k1"))).await.unwrap();

        assert!(outcome.created);
        let state = store.state.read().unwrap();
        assert_eq!(state.jobs.len(), 1);
        assert_eq!(state.outbox.len(), 1);
        assert_eq!(state.idempotency.get("k1").map(JobId::as_str), Some("job-1"));
    }

    #[tokio::test]
    async fn duplicate_key_returns_original_job_without_writes() {
        let store = InMemoryJobStore::new();
        store.create_job(new_job("job-1", Some("k1"))).await.unwrap();
        let second = store.create_job(new_job("job-2", Some("k1"))).await.unwrap();

        assert_eq!(second.job_id.as_str(), "job-1");
        assert!(!second.created);
        assert_eq!(store.job_count(), 1);
        assert_eq!(store.state.read().unwrap().outbox.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_job_id_without_key_is_a_conflict() {
        let store = InMemoryJobStore::new();
        store.create_job(new_job("job-1", None)).await.unwrap();
        let err = store.create_job(new_job("job-1", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn running_stamps_started_at_once() {
        let store = InMemoryJobStore::new();
        store.create_job(new_job("job-1", None)).await.unwrap();
        let id = JobId::parse("job-1").unwrap();

        store.set_status(&id, JobStatus::Running).await.unwrap();
        let first = store.get(&id).await.unwrap().unwrap().started_at;
        store.set_status(&id, JobStatus::Running).await.unwrap();
        let second = store.get(&id).await.unwrap().unwrap().started_at;

        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn republish_is_conditional_on_status() {
        let store = InMemoryJobStore::new();
        store.create_job(new_job("job-1", None)).await.unwrap();
        let id = JobId::parse("job-1").unwrap();
        store.set_status(&id, JobStatus::Running).await.unwrap();

        assert!(!store.republish(&id, JobStatus::Created, "jobs.created", json!({})).await.unwrap());
        assert!(store.republish(&id, JobStatus::Running, "jobs.created", json!({})).await.unwrap());

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert!(job.started_at.is_none());
        assert_eq!(store.state.read().unwrap().outbox.len(), 2);
    }

    #[tokio::test]
    async fn stuck_query_covers_every_category() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for id in ["fresh", "old-created", "no-start", "long-running"] {
            store.create_job(new_job(id, None)).await.unwrap();
        }
        let jid = |s: &str| JobId::parse(s).unwrap();

        store.backdate(&jid("old-created"), now - chrono::Duration::minutes(20), None);
        store.set_status(&jid("no-start"), JobStatus::Running).await.unwrap();
        store.backdate(&jid("no-start"), now - chrono::Duration::minutes(3), None);
        store.set_status(&jid("long-running"), JobStatus::Running).await.unwrap();
        store.backdate(
            &jid("long-running"),
            now - chrono::Duration::hours(2),
            Some(now - chrono::Duration::minutes(45)),
        );

        let stuck = store.find_stuck(&criteria(now)).await.unwrap();
        let ids: Vec<_> = stuck.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["long-running", "old-created", "no-start"]);

        let stats = store.stuck_stats(&criteria(now)).await.unwrap();
        assert_eq!(
            stats,
            StuckJobStats {
                stuck_created: 1,
                running_without_start: 1,
                running_too_long: 1,
            }
        );
    }
}
