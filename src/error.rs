use thiserror::Error;

use crate::job::ErrorKind;

#[derive(Error, Debug)]
pub enum MediaJobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Job queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Media engine not found: {0}")]
    EngineNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

impl MediaJobError {
    /// Coarse kind reported to the requester
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QueueFull(_) => ErrorKind::QueueFull,
            Self::QueueClosed => ErrorKind::QueueClosed,
            Self::EngineNotFound(_) => ErrorKind::EngineNotFound,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::Media(_) => ErrorKind::Failed,
            Self::Http(_) => ErrorKind::SourceFetch,
            _ => ErrorKind::InternalFault,
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaJobError>;
