//! error.rs — Storage and API error types
//!
//! `ApiError` is the only error a handler returns. It renders as
//! `{ "error": { "code", "message", "issues"? } }` with a matching status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ridesafe_types::AlertStatus;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::validation::FieldIssue;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request body is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("request failed validation")]
    Validation(Vec<FieldIssue>),
    #[error("alert not found")]
    AlertNotFound,
    #[error("alert already has a responder")]
    AlreadyAssigned,
    #[error("alert is {0} and can no longer be claimed")]
    NotClaimable(AlertStatus),
    #[error("cannot move alert from {from} to {to}")]
    InvalidTransition { from: AlertStatus, to: AlertStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MalformedJson(_) => "MALFORMED_JSON",
            ApiError::Validation(_) => "VALIDATION_FAILED",
            ApiError::AlertNotFound => "ALERT_NOT_FOUND",
            ApiError::AlreadyAssigned => "ALERT_ALREADY_ASSIGNED",
            ApiError::NotClaimable(_) => "ALERT_NOT_CLAIMABLE",
            ApiError::InvalidTransition { .. } => "INVALID_STATUS_TRANSITION",
            ApiError::Store(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MalformedJson(_) | ApiError::Validation(_) | ApiError::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::AlertNotFound => StatusCode::NOT_FOUND,
            ApiError::AlreadyAssigned | ApiError::NotClaimable(_) => StatusCode::CONFLICT,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Store(e) => {
                error!("Datastore failure: {e}");
                "internal datastore error".to_string()
            }
            other => other.to_string(),
        };
        let mut body = json!({ "code": self.code(), "message": message });
        if let ApiError::Validation(issues) = &self {
            body["issues"] = json!(issues);
        }
        (status, Json(json!({ "error": body }))).into_response()
    }
}
