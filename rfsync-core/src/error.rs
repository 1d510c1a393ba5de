//! Error types for rfsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by [`crate::MetadataCache`] construction and file operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Underlying I/O failure, with the path it happened on.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configured root exists but is not a directory.
    #[error("cache root {path} is not a directory")]
    NotADirectory { path: PathBuf },

    /// A name that is empty or escapes the root (`..` components).
    #[error("invalid file name {name:?}")]
    InvalidName { name: String },

    /// The file is not a known entry of the cache.
    #[error("file {name:?} is not tracked")]
    NotTracked { name: String },
}

/// Errors raised by [`crate::CredentialStore`].
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line of the password file is not `username:hash`.
    #[error("malformed password file {path} at line {line}")]
    Format { path: PathBuf, line: usize },

    #[error("username {0:?} is invalid: it must start with a letter and contain only letters, digits and underscores")]
    InvalidUsername(String),

    #[error("username {0:?} already exists")]
    UsernameExists(String),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// Errors raised while loading or validating the service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error, with the file path for context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// One or more semantic problems found by validation.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

pub(crate) fn cache_io(path: impl Into<PathBuf>, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn credential_io(path: impl Into<PathBuf>, source: std::io::Error) -> CredentialError {
    CredentialError::Io {
        path: path.into(),
        source,
    }
}
