//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use blastgate_core::BlastId;
use thiserror::Error;
use tracing::error;

use super::dto::ApiResponse;
use crate::application::lifecycle::LifecycleError;
use crate::application::orchestrator::DeliveryError;
use crate::infrastructure::storage::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("The Instance ID must be provided")]
    MissingInstance,

    #[error("The authentication process has failed")]
    Unauthorized,

    #[error("The Instance ID provided was not found")]
    InstanceNotFound,

    #[error("Blast {0} was not found")]
    BlastNotFound(BlastId),

    #[error("{0}")]
    BadRequest(String),

    /// The request is valid but the device or blast is in the wrong state.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("Internal error")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingInstance | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InstanceNotFound | ApiError::BlastNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SendFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            error!("request failed: {detail}");
        }
        (self.status_code(), Json(ApiResponse::error(self.to_string()))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DeviceNotFound(_) => ApiError::InstanceNotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::DeviceNotFound(_) => ApiError::InstanceNotFound,
            LifecycleError::Transport(e) => ApiError::Unavailable(e.to_string()),
            LifecycleError::Store(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::BlastNotFound(id) => ApiError::BlastNotFound(id),
            DeliveryError::Store(e) => e.into(),
            other @ (DeliveryError::NotPending { .. }
            | DeliveryError::BlastBusy { .. }
            | DeliveryError::NothingToRetry(_)) => ApiError::Conflict(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blastgate_core::BlastStatus;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::MissingInstance.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InstanceNotFound.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_busy_blast_is_a_conflict() {
        let e: ApiError = DeliveryError::BlastBusy {
            id: 3,
            status: BlastStatus::Processing,
        }
        .into();
        assert_eq!(e.status_code(), StatusCode::CONFLICT);
        assert_eq!(e.to_string(), "blast 3 is still processing");
    }
}
