//! Store error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt document {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state directory is locked by another run: {0}")]
    Locked(PathBuf),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for keel_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Locked(path) => keel_core::Error::Conflict(format!(
                "state directory {} is locked by another run",
                path.display()
            )),
            other => keel_core::Error::Store(other.to_string()),
        }
    }
}
