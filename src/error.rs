use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Timed out waiting for remote answer after {0}s")]
    AnswerTimeout(u64),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("NAS error: {0}")]
    Nas(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for the whole crate
pub type Result<T> = std::result::Result<T, AppError>;
