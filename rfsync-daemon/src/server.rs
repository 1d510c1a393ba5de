//! Server side of the protocol.
//!
//! Every accepted connection runs its own task: Join handshake first, then
//! either a connection-lifetime ChangeNotify stream (`SubscribePath`) or
//! one-shot requests (`RequestFile`, `FilesList`). Watch events reach the
//! server through its [`EventHandler`] impl and are fanned out to every
//! subscribed connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rfsync_core::{CredentialStore, Event, MetadataCache, Op};
use rfsync_watch::{EventHandler, EventResult, FanOut};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{net_err, DaemonError, ProtocolError};
use crate::protocol::{
    AckJoinPayload, FileMetaPayload, Frame, Message, PathFiles, RequestFilePayload,
};
use crate::transport::{BoxedTransport, Connection};

/// How long a fresh connection may stay silent before its first frame.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

pub const MSG_INVALID_PACKET: &str = "invalid packet type";
pub const MSG_BAD_CREDENTIALS: &str = "invalid username or password";
pub const MSG_SESSION_COLLISION: &str =
    "another system has logged in. if something is wrong call the server admin.";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    root: String,
    cache: Arc<MetadataCache>,
    credentials: Option<Arc<CredentialStore>>,
    tls: Option<TlsAcceptor>,
    hub: FanOut<Event>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Holds a username's session binding for one connection.
struct SessionGuard {
    store: Arc<CredentialStore>,
    username: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.store.unset_authenticated_user(&self.username);
        tracing::debug!(username = %self.username, "released session binding");
    }
}

/// Result of a successful Join exchange.
struct Admitted {
    session: Option<SessionGuard>,
    /// First request, when it arrived in place of a Join on an open server.
    pending: Option<Frame>,
}

impl Server {
    /// `buffer_size` bounds each subscribed connection's event queue.
    pub fn new(cache: Arc<MetadataCache>, buffer_size: usize) -> Self {
        Self {
            root: cache.root().display().to_string(),
            cache,
            credentials: None,
            tls: None,
            hub: FanOut::new(buffer_size),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Require every connection to Join against `store`.
    pub fn with_credentials(mut self, store: Arc<CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Connections currently streaming changes.
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Stop accepting and close every connection; [`serve`](Self::serve)
    /// returns once all connection tasks have exited.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), DaemonError> {
        let local = listener
            .local_addr()
            .map_err(|e| net_err("listener", e))?;
        tracing::info!(
            address = %local,
            root = %self.root,
            auth = self.credentials.is_some(),
            tls = self.tls.is_some(),
            "server listening",
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        self.tracker.spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(address = %local, error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.hub.close();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(address = %local, "server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let transport: BoxedTransport = match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => Box::new(stream),
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "TLS handshake failed");
                    return;
                }
            },
            None => Box::new(stream),
        };
        let mut conn = Connection::new(transport);

        let admitted = tokio::select! {
            _ = self.cancel.cancelled() => return,
            admitted = self.join(&mut conn, peer.ip()) => admitted,
        };
        let Admitted { session, pending } = match admitted {
            Ok(admitted) => admitted,
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "join failed, closing connection");
                return;
            }
        };
        let username = session.as_ref().map(|s| s.username.as_str());
        tracing::debug!(peer = %peer, username, "session established");

        match self.serve_session(&mut conn, peer, pending).await {
            Ok(()) => tracing::debug!(peer = %peer, username, "session closed"),
            Err(err) => {
                tracing::warn!(peer = %peer, username, error = %err, "session dropped")
            }
        }
        drop(session);
    }

    async fn join(&self, conn: &mut Connection, ip: IpAddr) -> Result<Admitted, DaemonError> {
        let first = tokio::time::timeout(JOIN_TIMEOUT, conn.reader.expect_frame())
            .await
            .map_err(|_| ProtocolError::Timeout("first frame"))??;

        let Some(store) = &self.credentials else {
            if matches!(first.message, Message::Join(_)) {
                ack(conn, &first, AckJoinPayload::accepted()).await?;
                return Ok(Admitted {
                    session: None,
                    pending: None,
                });
            }
            return Ok(Admitted {
                session: None,
                pending: Some(first),
            });
        };

        let Message::Join(join) = &first.message else {
            ack(conn, &first, AckJoinPayload::rejected(MSG_INVALID_PACKET)).await?;
            return Err(DaemonError::Rejected(format!(
                "{:?} received before Join",
                first.kind()
            )));
        };
        let username = join.username.clone();

        let verified = {
            let store = store.clone();
            let (username, password) = (join.username.clone(), join.password.clone());
            tokio::task::spawn_blocking(move || store.check_password(&username, &password))
                .await
                .unwrap_or(false)
        };
        if !verified {
            ack(conn, &first, AckJoinPayload::rejected(MSG_BAD_CREDENTIALS)).await?;
            return Err(DaemonError::Rejected(format!(
                "bad credentials for {username:?}"
            )));
        }

        if store.check_ip(&username, ip) {
            tracing::debug!(username = %username, ip = %ip, "joining existing session");
        }
        if !store.set_authenticated_user(&username, ip) {
            ack(conn, &first, AckJoinPayload::rejected(MSG_SESSION_COLLISION)).await?;
            return Err(DaemonError::Rejected(format!(
                "{username:?} is already logged in from another address"
            )));
        }
        let session = SessionGuard {
            store: store.clone(),
            username,
        };

        ack(conn, &first, AckJoinPayload::accepted()).await?;
        Ok(Admitted {
            session: Some(session),
            pending: None,
        })
    }

    async fn serve_session(
        &self,
        conn: &mut Connection,
        peer: SocketAddr,
        mut pending: Option<Frame>,
    ) -> Result<(), DaemonError> {
        loop {
            let frame = match pending.take() {
                Some(frame) => frame,
                None => {
                    let next = tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        next = conn.reader.read_frame() => next?,
                    };
                    match next {
                        Some(frame) => frame,
                        None => return Ok(()),
                    }
                }
            };

            match &frame.message {
                Message::SubscribePath(_) => return self.stream_changes(conn, peer).await,
                Message::RequestFile(request) => self.send_file(conn, &frame, request).await?,
                Message::FilesList(_) => self.send_listing(conn, &frame).await?,
                other => return Err(ProtocolError::OutOfSequence(other.kind()).into()),
            }
        }
    }

    async fn stream_changes(
        &self,
        conn: &mut Connection,
        peer: SocketAddr,
    ) -> Result<(), DaemonError> {
        let mut events = self.hub.subscribe();
        tracing::info!(peer = %peer, "subscriber attached");

        'stream: loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                inbound = conn.reader.read_frame() => match inbound {
                    Ok(None) => break,
                    Ok(Some(frame)) => {
                        tracing::debug!(peer = %peer, kind = ?frame.kind(), "ignoring frame on subscription stream");
                        continue;
                    }
                    Err(ProtocolError::Json(err)) => {
                        tracing::warn!(peer = %peer, error = %err, "malformed frame on subscription stream");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                },
            };

            for payload in self.notifications(&event).await {
                tracing::debug!(peer = %peer, file = %payload.file_name, size = payload.size, "sending change");
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'stream,
                    sent = conn.writer.send(Message::ChangeNotify(payload)) => sent?,
                }
            }
        }

        tracing::info!(peer = %peer, "subscriber detached");
        Ok(())
    }

    /// Build the ChangeNotify payloads for `event`.
    ///
    /// A directory that arrives whole (moved in, or copied recursively)
    /// produces one Write per file below it.
    async fn notifications(&self, event: &Event) -> Vec<FileMetaPayload> {
        if event.is_exit() {
            return Vec::new();
        }
        if event.op.intersects(Op::REMOVE | Op::RENAME) {
            return vec![FileMetaPayload {
                path: self.root.clone(),
                file_name: event.name.clone(),
                op: event.op,
                size: 0,
                change_date: Utc::now(),
            }];
        }

        let cache = self.cache.clone();
        let name = event.name.clone();
        let found = match tokio::task::spawn_blocking(move || cache.refresh_tree(&name)).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(event = %event, error = %err, "metadata refresh task failed");
                return Vec::new();
            }
        };
        if found.is_empty() {
            tracing::warn!(event = %event, "no metadata for changed path, dropping notification");
            return Vec::new();
        }

        found
            .iter()
            .filter_map(|meta| {
                if meta.name != event.name {
                    return Some(FileMetaPayload::from_meta(&self.root, meta, Op::WRITE));
                }
                // A bare Create has no content yet; the Write that follows does.
                (event.op != Op::CREATE)
                    .then(|| FileMetaPayload::from_meta(&self.root, meta, event.op))
            })
            .collect()
    }

    async fn send_file(
        &self,
        conn: &mut Connection,
        request: &Frame,
        payload: &RequestFilePayload,
    ) -> Result<(), DaemonError> {
        let cache = self.cache.clone();
        let name = payload.file_name.clone();
        let data = tokio::task::spawn_blocking(move || cache.read_file(&name))
            .await
            .map_err(|_| DaemonError::Task("file read"))??;
        tracing::debug!(file = %payload.file_name, bytes = data.len(), "serving file");
        conn.writer
            .write_frame(&Frame::reply_to(request, Message::ResponseFile(data)))
            .await?;
        Ok(())
    }

    async fn send_listing(&self, conn: &mut Connection, request: &Frame) -> Result<(), DaemonError> {
        let files: Vec<FileMetaPayload> = self
            .cache
            .list_all()
            .iter()
            .map(|meta| FileMetaPayload::from_meta(&self.root, meta, Op::WRITE))
            .collect();
        tracing::debug!(files = files.len(), "serving file listing");
        let listing = PathFiles {
            path: self.root.clone(),
            files,
        };
        conn.writer
            .write_frame(&Frame::reply_to(request, Message::FilesList(listing)))
            .await?;
        Ok(())
    }
}

async fn ack(conn: &mut Connection, request: &Frame, payload: AckJoinPayload) -> Result<(), ProtocolError> {
    conn.writer
        .write_frame(&Frame::reply_to(request, Message::AckJoin(payload)))
        .await
}

#[async_trait]
impl EventHandler for Server {
    async fn on_event(&self, event: EventResult) {
        match event {
            Ok(event) if event.is_noise() => {}
            Ok(event) => {
                let delivered = self.hub.publish(event).await;
                tracing::trace!(delivered, "change fanned out to subscribers");
            }
            Err(err) => {
                tracing::warn!(error = %err, "server received watch error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_over(dir: &tempfile::TempDir) -> Server {
        let cache = Arc::new(MetadataCache::new(dir.path()).unwrap());
        Server::new(cache, 4)
    }

    fn names(payloads: &[FileMetaPayload]) -> Vec<(&str, Op)> {
        payloads.iter().map(|p| (p.file_name.as_str(), p.op)).collect()
    }

    #[tokio::test]
    async fn bare_create_and_exit_produce_no_notification() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let server = server_over(&dir);

        assert!(server.notifications(&Event::new("a.txt", Op::CREATE)).await.is_empty());
        assert!(server.notifications(&Event::exit()).await.is_empty());
    }

    #[tokio::test]
    async fn write_is_enriched_with_current_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = server_over(&dir);
        // Written after the cache was built: enrichment must re-stat.
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let payloads = server.notifications(&Event::new("a.txt", Op::WRITE)).await;
        assert_eq!(names(&payloads), vec![("a.txt", Op::WRITE)]);
        assert_eq!(payloads[0].size, 5);
    }

    #[tokio::test]
    async fn removal_needs_no_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = server_over(&dir);

        let payloads = server.notifications(&Event::new("gone.txt", Op::REMOVE)).await;
        assert_eq!(names(&payloads), vec![("gone.txt", Op::REMOVE)]);
        assert_eq!(payloads[0].size, 0);
    }

    #[tokio::test]
    async fn write_without_file_is_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = server_over(&dir);
        assert!(server.notifications(&Event::new("missing.txt", Op::WRITE)).await.is_empty());
    }

    #[tokio::test]
    async fn arrived_directory_announces_each_file_as_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = server_over(&dir);
        std::fs::create_dir_all(dir.path().join("d/sub")).unwrap();
        std::fs::write(dir.path().join("d/f.txt"), b"five!").unwrap();
        std::fs::write(dir.path().join("d/sub/g.txt"), b"g").unwrap();

        // Moved in (Create|Write) and copied in (bare Create) both announce contents.
        for op in [Op::CREATE | Op::WRITE, Op::CREATE] {
            let payloads = server.notifications(&Event::new("d", op)).await;
            assert_eq!(
                names(&payloads),
                vec![("d/f.txt", Op::WRITE), ("d/sub/g.txt", Op::WRITE)]
            );
            assert_eq!(payloads[0].size, 5);
        }
    }

    #[tokio::test]
    async fn noise_is_not_fanned_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = server_over(&dir);
        let mut rx = server.hub.subscribe();

        server.on_event(Ok(Event::new(".a.txt.swp", Op::WRITE))).await;
        server.on_event(Ok(Event::new("a.txt", Op::CHMOD))).await;
        server.on_event(Ok(Event::new("a.txt", Op::WRITE))).await;
        server.hub.close();

        assert_eq!(rx.recv().await, Some(Event::new("a.txt", Op::WRITE)));
        assert_eq!(rx.recv().await, None);
    }
}
