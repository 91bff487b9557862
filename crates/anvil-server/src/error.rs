//! HTTP error mapping

use anvil_crd::CrdError;
use anvil_workflow::{ErrorBody, ErrorCode, WorkflowError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, error};

/// Error returned by every handler
///
/// Rendered as an [`ErrorBody`] with the status of its [`ErrorCode`].
#[derive(Debug)]
pub struct ApiError(pub ErrorBody);

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self(ErrorBody {
            code: ErrorCode::InvalidArgument,
            message: message.into(),
        })
    }

    pub fn code(&self) -> ErrorCode {
        self.0.code
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        Self(ErrorBody::from(&err))
    }
}

impl From<CrdError> for ApiError {
    fn from(err: CrdError) -> Self {
        WorkflowError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = %self.0.code, message = %self.0.message, "Request failed");
        } else {
            debug!(code = %self.0.code, message = %self.0.message, "Request rejected");
        }
        (status, Json(self.0)).into_response()
    }
}

/// Result type for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;
