use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the download subsystem
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Enqueue attempted before a save directory was configured
    #[error("Save path is not configured")]
    SavePathNotSet,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The destination directory could not be created
    #[error("Failed to create directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A lookup service could not produce a usable answer
    #[error("Resolve failed: {message}")]
    Resolve { message: String },

    #[error("{description}")]
    HttpStatus { status: u16, description: String },

    /// The transfer was stopped before it finished
    #[error("Transfer interrupted")]
    Interrupted,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Queue file could not be read or written
    #[error("Queue file error: {0}")]
    QueueFormat(String),
}

impl DownloadError {
    pub fn resolve(message: impl Into<String>) -> Self {
        Self::Resolve {
            message: message.into(),
        }
    }

    /// Build from a non-success HTTP status code
    pub fn from_status(status: u16) -> Self {
        let info = super::http_errors::HttpErrorInfo::from_status(status);
        Self::HttpStatus {
            status,
            description: info.format(),
        }
    }
}

impl From<toml::ser::Error> for DownloadError {
    fn from(err: toml::ser::Error) -> Self {
        Self::QueueFormat(err.to_string())
    }
}

impl From<toml::de::Error> for DownloadError {
    fn from(err: toml::de::Error) -> Self {
        Self::QueueFormat(err.to_string())
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
