//! Mapping of control-plane errors onto HTTP responses

use axum::{extract::rejection::JsonRejection, http::StatusCode, Json};
use tracing::{debug, error};
use wirewarp_control::{ControlError, ErrorKind};

use crate::models::ErrorResponse;

/// Handler error: status plus JSON body
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = Result<T, ApiError>;

pub fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
}

pub fn status_for(err: &ControlError) -> StatusCode {
    match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Token => match err {
            ControlError::TokenAlreadyUsed => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        },
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Service => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a control-plane error for the caller
///
/// Service errors are logged in full and reported generically.
pub fn control_error(err: ControlError) -> ApiError {
    let status = status_for(&err);

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", err);
        return api_error(status, "Internal server error", err.code());
    }

    debug!(code = err.code(), "Request rejected: {}", err);
    api_error(status, err.to_string(), err.code())
}

/// Unwrap a JSON body, reporting malformed input as a validation error
pub fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(api_error(
            StatusCode::BAD_REQUEST,
            rejection.body_text(),
            "VALIDATION_ERROR",
        )),
    }
}
