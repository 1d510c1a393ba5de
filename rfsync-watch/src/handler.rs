use std::sync::Arc;

use async_trait::async_trait;
use rfsync_core::{Event, MetadataCache};

use crate::error::EventError;

/// What every subscriber receives: an event or a backend error in its place.
pub type EventResult = Result<Event, EventError>;

/// A watch-engine subscriber.
///
/// Each registered handler is driven by its own dispatch task and sees every
/// event exactly once, in the order the OS reported them, followed by one
/// terminal [`Event::exit`] on shutdown.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: EventResult);
}

/// Keeps a [`MetadataCache`] current from watch events.
///
/// Applying an event stats (and for new directories walks) the disk, so it
/// runs on the blocking pool rather than a runtime worker.
pub struct CacheUpdater {
    cache: Arc<MetadataCache>,
}

impl CacheUpdater {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventHandler for CacheUpdater {
    async fn on_event(&self, event: EventResult) {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, paths = ?err.paths, "metadata cache skipped backend error");
                return;
            }
        };
        let cache = self.cache.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || cache.apply_event(&event)).await {
            tracing::warn!(error = %err, "metadata cache update task failed");
        }
    }
}
