//! Job intake: validate, verify, then create the job and its outbox message
//! atomically under an optional idempotency key.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use beacon_core::{DomainError, JobId};
use beacon_jobspec::{EffectiveConstraints, JobSpec, SignatureError, ValidationError};

use crate::error::StoreError;
use crate::jobs::{CreateOutcome, JobStore, NewJob};
use crate::outbox::{JobDispatch, TOPIC_JOB_CREATED};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid job spec: {0}")]
    Validation(#[from] ValidationError),

    #[error("signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    InvalidId(#[from] DomainError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub job_id: JobId,
    pub created: bool,
    pub constraints: EffectiveConstraints,
}

#[derive(Clone)]
pub struct IntakeService {
    jobs: Arc<dyn JobStore>,
}

impl IntakeService {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Accept a signed job spec.
    ///
    /// Nothing is written unless validation and signature verification pass.
    /// Resubmitting under a known key returns the original job with
    /// `created = false`.
    #[instrument(skip(self, spec), fields(idempotency_key = ?idempotency_key), err)]
    pub async fn submit(
        &self,
        idempotency_key: Option<String>,
        spec: JobSpec,
    ) -> Result<SubmitOutcome, IntakeError> {
        let constraints = beacon_jobspec::validate(&spec)?;
        if let Err(err) = beacon_jobspec::verify_job_spec(&spec) {
            warn!(error = %err, "rejecting job spec with bad signature");
            return Err(err.into());
        }

        let job_id = match spec.effective_id() {
            Some(id) => JobId::parse(id)?,
            None => JobId::generate(),
        };
        let idempotency_key = idempotency_key.filter(|k| !k.trim().is_empty());

        let CreateOutcome { job_id, created } = self
            .jobs
            .create_job(NewJob {
                id: job_id.clone(),
                spec,
                idempotency_key,
                outbox_topic: TOPIC_JOB_CREATED.to_string(),
                outbox_payload: JobDispatch::created(job_id).to_payload(),
            })
            .await?;

        if created {
            info!(job_id = %job_id, regions = constraints.regions.len(), "job accepted");
        } else {
            info!(job_id = %job_id, "duplicate submission resolved to existing job");
        }
        Ok(SubmitOutcome {
            job_id,
            created,
            constraints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use crate::outbox::OutboxStore;
    use ed25519_dalek::SigningKey;

    fn signed_spec(id: &str) -> JobSpec {
        let mut spec = JobSpec {
            id: id.into(),
            version: "v1".into(),
            questions: vec!["Q1".into()],
            ..Default::default()
        };
        spec.benchmark.name = "bias-detection".into();
        spec.benchmark.container.image = "ghcr.io/beacon/bias".into();
        spec.benchmark.input.hash = "sha256:abc".into();
        spec.constraints.regions = vec!["US".into(), "EU".into()];
        beacon_jobspec::sign_job_spec(&mut spec, &SigningKey::from_bytes(&[7u8; 32])).unwrap();
        spec
    }

    #[tokio::test]
    async fn accepted_job_lands_with_one_outbox_message() {
        let store = InMemoryJobStore::arc();
        let intake = IntakeService::new(store.clone());

        let outcome = intake.submit(Some("key-1".into()), signed_spec("job-1")).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.job_id.as_str(), "job-1");

        let pending = store.fetch_unpublished(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["job_id"], "job-1");
    }

    #[tokio::test]
    async fn tampered_spec_creates_nothing() {
        let store = InMemoryJobStore::arc();
        let intake = IntakeService::new(store.clone());
        let mut spec = signed_spec("job-1");
        spec.constraints.regions.push("APAC".into());

        let err = intake.submit(Some("key-1".into()), spec).await.unwrap_err();
        assert!(matches!(err, IntakeError::Signature(SignatureError::ContentMismatch)));
        assert_eq!(store.job_count(), 0);
        assert_eq!(store.stats().await.unwrap().unpublished, 0);
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_before_verification() {
        let intake = IntakeService::new(InMemoryJobStore::arc());
        let mut spec = signed_spec("job-1");
        spec.signature.clear();
        spec.constraints.regions.clear();

        let err = intake.submit(None, spec).await.unwrap_err();
        assert!(matches!(err, IntakeError::Validation(ValidationError::NoRegions)));
    }

    #[tokio::test]
    async fn same_key_returns_the_first_job() {
        let store = InMemoryJobStore::arc();
        let intake = IntakeService::new(store.clone());

        let first = intake.submit(Some("k".into()), signed_spec("job-1")).await.unwrap();
        let second = intake.submit(Some("k".into()), signed_spec("job-2")).await.unwrap();

        assert_eq!(second.job_id, first.job_id);
        assert!(!second.created);
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn spec_without_id_gets_a_generated_one() {
        let store = InMemoryJobStore::arc();
        let intake = IntakeService::new(store.clone());

        let a = intake.submit(None, signed_spec("")).await.unwrap();
        let b = intake.submit(None, signed_spec("")).await.unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(store.job_count(), 2);
    }
}
