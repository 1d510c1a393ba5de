//! Sync client: mirrors a server's tree into a local root.
//!
//! One long-lived session carries the ChangeNotify stream. A background
//! downloader applies each change in order, opening a fresh short-lived
//! session for every file it fetches.

use std::sync::Arc;
use std::time::Duration;

use rfsync_core::{MetadataCache, Op};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{DaemonError, ProtocolError};
use crate::protocol::{
    FileMetaPayload, Message, MessageKind, PathFiles, RequestFilePayload, SubscribePathPayload,
};
use crate::transport::{Connection, Dialer};

/// Rolling deadline for one read on the subscription stream.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of the download queue; 1 serializes downloads behind the reader.
pub const DOWNLOAD_QUEUE_DEPTH: usize = 1;

pub struct SyncClient {
    dialer: Dialer,
    cache: Arc<MetadataCache>,
    initial_sync: bool,
    cancel: CancellationToken,
}

impl SyncClient {
    pub fn new(dialer: Dialer, cache: Arc<MetadataCache>) -> Self {
        Self {
            dialer,
            cache,
            initial_sync: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Pull files that differ from the server before following changes.
    pub fn initial_sync(mut self, enabled: bool) -> Self {
        self.initial_sync = enabled;
        self
    }

    /// Ask [`run`](Self::run) to stop; it returns `Ok(())` once the reader
    /// and the downloader have exited.
    pub fn exit(&self) {
        self.cancel.cancel();
    }

    /// Connect, subscribe and apply changes until [`exit`](Self::exit) is
    /// called or the server goes away.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let mut conn = self.dialer.open_session().await?;
        tracing::info!(address = %self.dialer.address(), "connected to server");

        let (queue, pending) = mpsc::channel(DOWNLOAD_QUEUE_DEPTH);
        let downloader = Downloader {
            dialer: self.dialer.clone(),
            cache: self.cache.clone(),
            cancel: self.cancel.clone(),
        };
        let worker = tokio::spawn(downloader.run(pending));

        let result = self.follow(&mut conn, &queue).await;
        drop(queue);
        if worker.await.is_err() {
            tracing::error!("download worker panicked");
        }
        result
    }

    /// Fetch one file from the server on its own session.
    pub async fn fetch(&self, file_name: &str) -> Result<Vec<u8>, DaemonError> {
        fetch(
            &self.dialer,
            RequestFilePayload {
                path: String::new(),
                file_name: file_name.to_string(),
                change_date: chrono::Utc::now(),
            },
        )
        .await
    }

    /// The server's current file listing.
    pub async fn list_remote(&self) -> Result<PathFiles, DaemonError> {
        list_remote(&self.dialer).await
    }

    async fn follow(
        &self,
        conn: &mut Connection,
        queue: &mpsc::Sender<FileMetaPayload>,
    ) -> Result<(), DaemonError> {
        conn.writer
            .send(Message::SubscribePath(SubscribePathPayload::default()))
            .await?;
        tracing::info!("subscribed to changes");

        // Listed only after subscribing, so a change landing mid-listing
        // still reaches us on the stream.
        let seeding = self.initial_sync.then(|| {
            let seeder = Seeder {
                dialer: self.dialer.clone(),
                cache: self.cache.clone(),
                queue: queue.clone(),
                cancel: self.cancel.clone(),
            };
            tokio::spawn(seeder.run())
        });

        let result = self.read_changes(conn, queue).await;
        if let Some(seeding) = seeding {
            seeding.abort();
            let _ = seeding.await;
        }
        result
    }

    async fn read_changes(
        &self,
        conn: &mut Connection,
        queue: &mpsc::Sender<FileMetaPayload>,
    ) -> Result<(), DaemonError> {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                read = tokio::time::timeout(READ_TIMEOUT, conn.reader.read_frame()) => read,
            };
            let frame = match read {
                Err(_) => {
                    tracing::trace!("no change within read window");
                    continue;
                }
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return Err(ProtocolError::Closed.into()),
                Ok(Err(ProtocolError::Json(err))) => {
                    tracing::warn!(error = %err, "discarding malformed frame");
                    continue;
                }
                Ok(Err(err)) => return Err(err.into()),
            };

            match frame.message {
                Message::ChangeNotify(change) => {
                    tracing::debug!(file = %change.file_name, op = %change.op, size = change.size, "change received");
                    if !enqueue(&self.cancel, queue, change).await {
                        return Ok(());
                    }
                }
                other => {
                    tracing::debug!(kind = ?other.kind(), "ignoring frame on subscription stream");
                }
            }
        }
    }
}

/// Queues the initial download of every remote file that is stale locally.
struct Seeder {
    dialer: Dialer,
    cache: Arc<MetadataCache>,
    queue: mpsc::Sender<FileMetaPayload>,
    cancel: CancellationToken,
}

impl Seeder {
    /// Local-only files are left alone.
    async fn run(self) {
        let listing = match list_remote(&self.dialer).await {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(error = %err, "initial sync skipped");
                return;
            }
        };
        let remote = listing.files.len();
        let stale: Vec<FileMetaPayload> = listing
            .files
            .into_iter()
            .filter(|file| is_stale(&self.cache, file))
            .collect();
        tracing::info!(remote, stale = stale.len(), "initial sync");

        for change in stale {
            if !enqueue(&self.cancel, &self.queue, change).await {
                return;
            }
        }
    }
}

/// Missing locally, or differing in size or modification time.
fn is_stale(cache: &MetadataCache, remote: &FileMetaPayload) -> bool {
    match cache.lookup(&remote.file_name) {
        None => true,
        Some(local) => {
            local.size != remote.size
                || local.modify_time.timestamp() != remote.change_date.timestamp()
        }
    }
}

/// `false` when the client is exiting or the downloader is gone.
async fn enqueue(
    cancel: &CancellationToken,
    queue: &mpsc::Sender<FileMetaPayload>,
    change: FileMetaPayload,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = queue.send(change) => sent.is_ok(),
    }
}

struct Downloader {
    dialer: Dialer,
    cache: Arc<MetadataCache>,
    cancel: CancellationToken,
}

impl Downloader {
    async fn run(self, mut pending: mpsc::Receiver<FileMetaPayload>) {
        loop {
            let change = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                change = pending.recv() => match change {
                    Some(change) => change,
                    None => break,
                },
            };

            let applied = tokio::select! {
                _ = self.cancel.cancelled() => break,
                applied = self.apply(&change) => applied,
            };
            if let Err(err) = applied {
                tracing::warn!(file = %change.file_name, op = %change.op, error = %err, "failed to apply change");
            }
        }
        tracing::debug!("download worker stopped");
    }

    async fn apply(&self, change: &FileMetaPayload) -> Result<(), DaemonError> {
        if change.op.intersects(Op::REMOVE | Op::RENAME) {
            let cache = self.cache.clone();
            let name = change.file_name.clone();
            tokio::task::spawn_blocking(move || cache.remove_file(&name))
                .await
                .map_err(|_| DaemonError::Task("local remove"))??;
            tracing::info!(file = %change.file_name, "removed local copy");
            return Ok(());
        }
        if !change.op.contains(Op::WRITE) {
            tracing::debug!(file = %change.file_name, op = %change.op, "nothing to download");
            return Ok(());
        }

        let data = fetch(&self.dialer, RequestFilePayload::from(change)).await?;
        let bytes = data.len();
        let cache = self.cache.clone();
        let name = change.file_name.clone();
        let modified = change.change_date;
        tokio::task::spawn_blocking(move || {
            cache.write_file(&name, &data)?;
            cache.set_modify_time(&name, modified)
        })
        .await
        .map_err(|_| DaemonError::Task("local write"))??;
        tracing::info!(file = %change.file_name, bytes, "downloaded");
        Ok(())
    }
}

async fn fetch(dialer: &Dialer, request: RequestFilePayload) -> Result<Vec<u8>, DaemonError> {
    let mut conn = dialer.open_session().await?;
    conn.writer.send(Message::RequestFile(request)).await?;
    let reply = conn.reply("ResponseFile").await?;
    match reply.message {
        Message::ResponseFile(data) => Ok(data),
        other => Err(ProtocolError::UnexpectedKind {
            expected: MessageKind::ResponseFile,
            received: other.kind(),
        }
        .into()),
    }
}

async fn list_remote(dialer: &Dialer) -> Result<PathFiles, DaemonError> {
    let mut conn = dialer.open_session().await?;
    conn.writer.send(Message::FilesList(PathFiles::default())).await?;
    let reply = conn.reply("FilesList").await?;
    match reply.message {
        Message::FilesList(listing) => Ok(listing),
        other => Err(ProtocolError::UnexpectedKind {
            expected: MessageKind::FilesList,
            received: other.kind(),
        }
        .into()),
    }
}
