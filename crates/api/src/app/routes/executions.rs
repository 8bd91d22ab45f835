use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use beacon_core::UnitId;
use beacon_infra::retry::RetryOutcome;

use crate::app::dto::RetryQuestionRequest;
use crate::app::errors;
use crate::app::services::AppServices;

pub async fn get_unit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: UnitId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    match services.executions.get_unit(id).await {
        Ok(Some(unit)) => Json(unit).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("execution {id} not found")),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Retry one (region, question) cell of the execution `:id` belongs to.
pub async fn retry_question(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<RetryQuestionRequest>,
) -> axum::response::Response {
    let anchor: UnitId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let outcome = match services
        .retries
        .retry(anchor, &body.region, body.question_index)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return errors::retry_error_to_response(e),
    };

    let status = match &outcome {
        RetryOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        RetryOutcome::AlreadyCompleted { .. } | RetryOutcome::InFlight { .. } => StatusCode::OK,
        RetryOutcome::Exhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
        RetryOutcome::NotRetryable { .. } => StatusCode::BAD_REQUEST,
    };
    (status, Json(outcome)).into_response()
}
