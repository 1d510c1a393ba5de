//! # rfsync-watch
//!
//! Filesystem watch engine with per-subscriber fan-out.
//!
//! Build a [`Watcher`] with [`Watcher::builder`], register every
//! [`EventHandler`] before [`WatcherBuilder::start`], and call
//! [`Watcher::close`] to broadcast the terminal exit event and join all
//! dispatch tasks.

pub mod error;
pub mod fanout;
pub mod handler;
pub mod watcher;

pub use error::{EventError, WatchError};
pub use fanout::FanOut;
pub use handler::{CacheUpdater, EventHandler, EventResult};
pub use watcher::{Watcher, WatcherBuilder};
