use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeriscopeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Request to app failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("App returned {status}: {body}")]
    AppStatus { status: u16, body: String },

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("App error: {0}")]
    AppError(#[from] periscope_app::AppError),

    #[error("Server error: {0}")]
    ServerError(String),
}

pub type Result<T> = std::result::Result<T, PeriscopeError>;
