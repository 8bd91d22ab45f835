use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn outbox_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.outbox.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn repair_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.repair.stuck_job_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
