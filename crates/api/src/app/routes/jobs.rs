use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use beacon_core::JobId;
use beacon_jobspec::JobSpec;

use crate::app::dto::{CrossRegionSummary, SubmitJobResponse};
use crate::app::errors;
use crate::app::services::AppServices;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    JobId::parse(raw).map_err(errors::domain_error_to_response)
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(spec): Json<JobSpec>,
) -> axum::response::Response {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match services.intake.submit(key, spec).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(SubmitJobResponse {
                job_id: outcome.job_id,
                created: outcome.created,
            }),
        )
            .into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.jobs.get(&id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_job_units(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.executions.units_for_job(&id).await {
        Ok(units) => Json(units).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn cross_region_summary(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let execution = match services.executions.execution_for_job(&id).await {
        Ok(Some(execution)) => execution,
        Ok(None) => {
            return errors::json_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no cross-region execution for job {id}"),
            );
        }
        Err(e) => return errors::store_error_to_response(e),
    };
    match services.executions.region_results(execution.id).await {
        Ok(regions) => Json(CrossRegionSummary { execution, regions }).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
