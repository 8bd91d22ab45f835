use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use beacon_core::DomainError;
use beacon_infra::StoreError;
use beacon_infra::intake::IntakeError;
use beacon_infra::retry::RetryError;
use beacon_infra::transparency::TransparencyError;

pub fn intake_error_to_response(err: IntakeError) -> axum::response::Response {
    match err {
        IntakeError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        IntakeError::Signature(e) => json_error(StatusCode::BAD_REQUEST, "invalid_signature", e.to_string()),
        IntakeError::InvalidId(e) => domain_error_to_response(e),
        IntakeError::Store(e) => store_error_to_response(e),
    }
}

pub fn retry_error_to_response(err: RetryError) -> axum::response::Response {
    match err {
        RetryError::NotFound { .. } => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        RetryError::Store(e) => store_error_to_response(e),
        RetryError::Coordination(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "coordination_error", e.to_string())
        }
        RetryError::Domain(e) => domain_error_to_response(e),
    }
}

pub fn transparency_error_to_response(err: TransparencyError) -> axum::response::Response {
    match err {
        TransparencyError::Store(e) => store_error_to_response(e),
        TransparencyError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        TransparencyError::InvalidRange { .. } | TransparencyError::IncompleteRange { .. } => {
            json_error(StatusCode::BAD_REQUEST, "invalid_range", err.to_string())
        }
        TransparencyError::Contention(_) => json_error(StatusCode::CONFLICT, "contention", err.to_string()),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
        StoreError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
