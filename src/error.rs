use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorBody;

/// Failures talking to the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("cannot reach container engine: {0}")]
    Unreachable(#[source] std::io::Error),

    #[error("container engine responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("container engine stream failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed container engine response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
}

/// An error answered as a plain JSON response, before any stream starts.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, body: ErrorBody) -> Self {
        Self { status, body }
    }

    /// 500 with the engine error as `details`.
    pub fn engine(error: &str, cause: &EngineError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody::new(error).with_details(cause),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
