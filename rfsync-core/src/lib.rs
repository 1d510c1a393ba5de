//! Core types shared by the rfsync watcher, daemon and CLI.
//!
//! - [`event`]: [`Op`] flags and the [`Event`] value produced by the watch engine
//! - [`cache`]: [`MetadataCache`], the path → size/modify-time mirror of a root
//! - [`credentials`]: [`CredentialStore`], bcrypt password file + session bindings
//! - [`config`]: YAML service configuration
//! - [`error`]: error enums for all of the above

pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event;

pub use cache::{normalize_name, relative_key, FileMeta, MetadataCache};
pub use config::{Config, ServiceType};
pub use credentials::CredentialStore;
pub use error::{CacheError, ConfigError, CredentialError};
pub use event::{Event, Op, EXIT_NAME};
