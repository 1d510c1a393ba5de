//! Error types for rfsync-watch.

use std::path::PathBuf;

use thiserror::Error;

/// Construction-time failures; no partially armed watcher is ever returned.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watch root {path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("watcher must be started from within a Tokio runtime")]
    NoRuntime,
}

/// A backend error delivered to subscribers in place of an event.
#[derive(Debug, Clone, Error)]
#[error("watch backend error: {message}")]
pub struct EventError {
    pub message: String,
    pub paths: Vec<PathBuf>,
}

impl From<&notify::Error> for EventError {
    fn from(err: &notify::Error) -> Self {
        Self {
            message: err.to_string(),
            paths: err.paths.clone(),
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> WatchError {
    WatchError::Io {
        path: path.into(),
        source,
    }
}
