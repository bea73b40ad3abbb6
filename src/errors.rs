use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("identifier source not found: {}", path.display())]
    SourceMissing { path: PathBuf },
    #[error("dataset unavailable at {}: {source}", path.display())]
    DatasetUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
}

/// Failure of a single identifier's fetch. Recorded per identifier, never fatal to a batch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("remote returned status {status}")]
    RemoteStatus { status: u16 },
    #[error("malformed response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FetchError::RemoteStatus {
                status: status.as_u16(),
            },
            None if err.is_decode() => FetchError::Decode(err.to_string()),
            None => FetchError::Transport(err),
        }
    }
}
