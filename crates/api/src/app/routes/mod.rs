use axum::{
    Router,
    routing::{get, post},
};

pub mod executions;
pub mod jobs;
pub mod system;
pub mod transparency;

/// Router for everything under `/api/v1`.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/executions", get(jobs::list_job_units))
        .route("/jobs/:id/cross-region", get(jobs::cross_region_summary))
        .route("/executions/:id", get(executions::get_unit))
        .route("/executions/:id/retry-question", post(executions::retry_question))
        .nest("/transparency", transparency::router())
        .route("/outbox/stats", get(system::outbox_stats))
        .route("/repair/stats", get(system::repair_stats))
}
