use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// AppError
///
/// The user-facing error taxonomy. Every failure in the request path resolves into one of
/// these variants, and every variant renders as a JSON body the calling view can display
/// inline. None of them is fatal to the process.
#[derive(Error, Debug)]
pub enum AppError {
    /// Valid lookup, no record. The operator corrects the identifier or aborts.
    #[error("no material record exists for identifier {0}")]
    NotFound(String),

    /// The record exists but violates the minimal shape contract. Surfaced, never repaired.
    #[error("material record {id} is malformed: {reason}")]
    DataIntegrity { id: String, reason: String },

    /// Network, store or provider failure. The cause is logged, not returned.
    #[error("the service is temporarily unreachable, try again")]
    Transient(String),

    #[error("you do not have access to this section")]
    PermissionDenied,

    #[error("cannot access camera: {0}")]
    DeviceAccess(String),

    #[error("scanned payload is empty")]
    EmptyPayload,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("internal error")]
    Internal(String),
}

/// ErrorBody
///
/// Wire shape of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Stable machine-readable kind, e.g. `not_found` or `transient`.
    pub error: String,
    pub message: String,
    /// True when the same request may succeed if simply retried.
    pub retryable: bool,
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::DataIntegrity { .. } => "data_integrity",
            AppError::Transient(_) => "transient",
            AppError::PermissionDenied => "permission_denied",
            AppError::DeviceAccess(_) => "device_access",
            AppError::EmptyPayload => "empty_payload",
            AppError::Validation(_) => "validation",
            AppError::Unauthorized => "unauthorized",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::DataIntegrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Transient(_) | AppError::DeviceAccess(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PermissionDenied => StatusCode::FORBIDDEN,
            AppError::EmptyPayload | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, AppError::Transient(_) | AppError::DeviceAccess(_))
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Transient(cause) => tracing::warn!(cause = %cause, "transient failure"),
            AppError::Internal(cause) => tracing::error!(cause = %cause, "internal failure"),
            AppError::DataIntegrity { id, reason } => {
                tracing::error!(material_id = %id, reason = %reason, "malformed material record")
            }
            _ => {}
        }

        let status = self.status();
        let retryable = self.retryable();
        let mut response = (status, Json(self.body())).into_response();
        if retryable {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}
