use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeedtestError {
    #[error("payload generation failed: {0}")]
    PayloadGeneration(#[from] tokio::task::JoinError),
    #[error("request body error: {0}")]
    Body(#[from] axum::Error),
    #[error("upload did not finish within {0:?}")]
    UploadTimeout(std::time::Duration),
    #[error("page template {path}: {source}")]
    Template {
        path: String,
        source: std::io::Error,
    },
    #[error("serialize/deserialize error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SpeedtestError {
    /// Status code returned to the client when this error reaches the dispatcher.
    pub fn status(&self) -> StatusCode {
        match self {
            SpeedtestError::UploadTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Opaque body sent with [`status`](Self::status); never carries error details.
    pub fn public_message(&self) -> &'static str {
        match self {
            SpeedtestError::UploadTimeout(_) => "Request timeout",
            _ => "Internal server error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SpeedtestError>;
