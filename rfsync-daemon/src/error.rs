use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::MessageKind;

/// Failures of a single frame or of the transport underneath it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed by peer")]
    Closed,

    #[error("connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("unknown message type {0}")]
    UnknownKind(u8),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("short write: frame of {expected} bytes not fully written")]
    ShortWrite { expected: usize },

    #[error("expected {expected:?} but received {received:?}")]
    UnexpectedKind {
        expected: MessageKind,
        received: MessageKind,
    },

    #[error("{0:?} is not valid at this point of the session")]
    OutOfSequence(MessageKind),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error surface for the server, the sync client and runtime bootstrap.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network error on {address}: {source}")]
    Net {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("watch error: {0}")]
    Watch(#[from] rfsync_watch::WatchError),

    #[error("cache error: {0}")]
    Cache(#[from] rfsync_core::CacheError),

    #[error("credential error: {0}")]
    Credential(#[from] rfsync_core::CredentialError),

    #[error("config error: {0}")]
    Config(#[from] rfsync_core::ConfigError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("join rejected by server: {0}")]
    Rejected(String),

    #[error("{0} task join failure")]
    Task(&'static str),
}

impl From<rustls::Error> for DaemonError {
    fn from(err: rustls::Error) -> Self {
        DaemonError::Tls(err.to_string())
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn net_err(address: impl Into<String>, source: std::io::Error) -> DaemonError {
    DaemonError::Net {
        address: address.into(),
        source,
    }
}
