//! HTTP-facing errors and their JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kubelive_api::ApiError;
use kubelive_hub::HubError;
use serde::Serialize;
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to {0}: {1}")]
    BindFailed(std::net::SocketAddr, std::io::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ServerError {
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Api(e) => {
                let status = match e {
                    ApiError::Validation(_) => StatusCode::BAD_REQUEST,
                    ApiError::NotFound(_) => StatusCode::NOT_FOUND,
                    ApiError::Conflict(_) => StatusCode::CONFLICT,
                    ApiError::Cluster(_) => StatusCode::BAD_GATEWAY,
                    ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.tag())
            }
            Self::Hub(HubError::TooManySubscribers { .. }) => (StatusCode::SERVICE_UNAVAILABLE, "too_many_subscribers"),
            Self::Hub(HubError::Closed) => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            Self::BindFailed(_, _) | Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = ErrorResponse { error: error_type.to_string(), message: self.to_string() };
        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });
        (status, [("content-type", "application/json")], json).into_response()
    }
}
