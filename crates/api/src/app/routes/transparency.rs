use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde_json::json;

use crate::app::dto::{AnchorRequest, BatchRequest, EntriesQuery, EntryView};
use crate::app::errors;
use crate::app::services::AppServices;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1_000;

pub fn router() -> Router {
    Router::new()
        .route("/entries", get(list_entries))
        .route("/entries/:index/proof", get(entry_proof))
        .route("/verify", get(verify))
        .route("/batches", post(seal_batch))
        .route("/anchors", post(anchor_range))
}

/// `?job_id=` selects by job, `?start=&end=` by index range, and anything
/// else pages through the log with `limit`/`offset`.
pub async fn list_entries(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<EntriesQuery>,
) -> axum::response::Response {
    let log = &services.transparency;
    let entries = match (&query.job_id, query.start, query.end) {
        (Some(job_id), _, _) => log.by_job(job_id).await,
        (None, Some(start), Some(end)) => log.range(start, end).await,
        (None, Some(_), None) | (None, None, Some(_)) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_range",
                "start and end must be given together",
            );
        }
        (None, None, None) => {
            let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
            log.list(limit, query.offset.unwrap_or(0)).await
        }
    };

    match entries {
        Ok(entries) => {
            let views: Vec<EntryView> = entries
                .into_iter()
                .map(|entry| EntryView::new(entry, query.proof))
                .collect();
            Json(json!({ "count": views.len(), "entries": views })).into_response()
        }
        Err(e) => errors::transparency_error_to_response(e),
    }
}

pub async fn entry_proof(
    Extension(services): Extension<Arc<AppServices>>,
    Path(index): Path<u64>,
) -> axum::response::Response {
    match services.transparency.proof_for(index).await {
        Ok((entry, Some(proof))) => Json(json!({
            "log_index": entry.log_index,
            "proof": proof,
            "valid": proof.verify(),
        }))
        .into_response(),
        Ok((entry, None)) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_batched",
            format!("log entry {} has not been sealed into a batch", entry.log_index),
        ),
        Err(e) => errors::transparency_error_to_response(e),
    }
}

pub async fn verify(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.transparency.verify_integrity().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::transparency_error_to_response(e),
    }
}

pub async fn seal_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<BatchRequest>,
) -> axum::response::Response {
    match services.transparency.batch(body.start, body.end).await {
        Ok(summary) => (StatusCode::CREATED, Json(summary)).into_response(),
        Err(e) => errors::transparency_error_to_response(e),
    }
}

pub async fn anchor_range(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<AnchorRequest>,
) -> axum::response::Response {
    let timestamp = body.timestamp.unwrap_or_else(Utc::now);
    match services
        .transparency
        .anchor(body.start, body.end, body.tx_hash, body.block_number, timestamp)
        .await
    {
        Ok(anchored) => Json(json!({ "anchored": anchored })).into_response(),
        Err(e) => errors::transparency_error_to_response(e),
    }
}
