//! Outbox message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use beacon_core::JobId;

/// Topic of the message announcing a job that is ready to run.
pub const TOPIC_JOB_CREATED: &str = "jobs.created";

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Monotonically increasing; defines dispatch order.
    pub id: i64,
    pub topic: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Failed dispatch attempts so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set once the publisher gives up on the row; it is never fetched again.
    #[serde(default)]
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(id: i64, topic: impl Into<String>, payload: JsonValue, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            topic: topic.into(),
            payload,
            created_at,
            published_at: None,
            attempts: 0,
            last_error: None,
            dead_lettered_at: None,
        }
    }

    /// Neither published nor dead-lettered.
    pub fn is_pending(&self) -> bool {
        self.published_at.is_none() && self.dead_lettered_at.is_none()
    }
}

/// Operational health of the outbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutboxStats {
    pub unpublished: u64,
    /// Age of the oldest unpublished row, 0 when the outbox is drained.
    pub oldest_unpublished_age_secs: f64,
    /// Rows the publisher gave up on.
    pub dead_lettered: u64,
}

/// Payload of a `jobs.created` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDispatch {
    pub job_id: JobId,
    /// Why the message was written: "created" at intake, or a repair action.
    #[serde(default = "JobDispatch::default_reason")]
    pub reason: String,
}

impl JobDispatch {
    pub fn created(job_id: JobId) -> Self {
        Self {
            job_id,
            reason: Self::default_reason(),
        }
    }

    pub fn repaired(job_id: JobId, action: &str) -> Self {
        Self {
            job_id,
            reason: action.to_string(),
        }
    }

    fn default_reason() -> String {
        "created".to_string()
    }

    pub fn to_payload(&self) -> JsonValue {
        serde_json::json!({ "job_id": self.job_id, "reason": self.reason })
    }
}
