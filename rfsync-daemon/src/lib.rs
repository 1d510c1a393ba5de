//! rfsync daemon: wire protocol, server sessions, sync client and runtime.

pub mod client;
mod error;
pub mod protocol;
mod runtime;
pub mod server;
pub mod tls;
pub mod transport;

pub use client::SyncClient;
pub use error::{DaemonError, ProtocolError};
pub use runtime::{dialer_for, init_tracing, run, start_blocking};
pub use server::Server;
pub use transport::{Connection, Credentials, Dialer};
