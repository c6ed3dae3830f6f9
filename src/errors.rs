use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Classification of directory API failures. Only `RateLimited` is retryable;
/// everything else causes the current tile to be skipped.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory rate limit exceeded after retries")]
    RateLimited,
    #[error("directory rejected the request: {0}")]
    BadRequest(String),
    #[error("directory authentication failed (check the API key)")]
    Auth,
    #[error("directory provider outage (status {0})")]
    Outage(u16),
    #[error("unexpected directory response status {0}")]
    Unexpected(u16),
}

impl DirectoryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DirectoryError::RateLimited)
    }
}
