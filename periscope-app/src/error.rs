use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use periscope_common::{CodecError, ControlError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("bad report: {0}")]
    BadReport(#[from] CodecError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("pipe {0} not found")]
    PipeNotFound(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadReport(_) => StatusCode::BAD_REQUEST,
            AppError::Control(ControlError::ProbeNotConnected(_)) => StatusCode::NOT_FOUND,
            AppError::Control(ControlError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Control(ControlError::Disconnected(_)) => StatusCode::BAD_GATEWAY,
            AppError::Control(_) => StatusCode::BAD_REQUEST,
            AppError::PipeNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Metrics(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
