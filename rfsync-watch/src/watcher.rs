//! Filesystem watch engine.
//!
//! Every directory below the root gets its own non-recursive OS watch, and
//! directories created later are armed as soon as their Create arrives. Raw
//! notifications are translated into root-relative [`Event`]s and fanned out
//! to one bounded queue per registered [`EventHandler`].

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use rfsync_core::config::DEFAULT_BUFFER_SIZE;
use rfsync_core::{relative_key, Event, Op};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{io_err, EventError, WatchError};
use crate::fanout::FanOut;
use crate::handler::{EventHandler, EventResult};

/// The OS watch plus the set of directories it currently has armed.
struct Backend {
    watcher: RecommendedWatcher,
    armed: HashSet<PathBuf>,
}

type SharedBackend = Arc<Mutex<Option<Backend>>>;

const MOVED_IN: Op = Op::CREATE.union(Op::WRITE);

pub struct WatcherBuilder {
    root: PathBuf,
    buffer_size: usize,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl WatcherBuilder {
    /// Depth of each subscriber queue.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Register a subscriber. All subscribers must be registered before
    /// [`start`](Self::start).
    pub fn subscribe(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Arm the OS watches and spawn the fan-out and dispatch tasks.
    ///
    /// Must be called from within a Tokio runtime. Any registration failure
    /// aborts construction; no partially armed watcher is returned.
    pub fn start(self) -> Result<Watcher, WatchError> {
        let runtime = Handle::try_current().map_err(|_| WatchError::NoRuntime)?;

        let root = fs::canonicalize(&self.root).map_err(|e| io_err(&self.root, e))?;
        if !root.is_dir() {
            return Err(WatchError::NotADirectory { path: root });
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let watcher = recommended_watcher(move |event| {
            let _ = raw_tx.send(event);
        })?;
        let mut backend = Backend {
            watcher,
            armed: HashSet::new(),
        };
        arm_tree(&mut backend, &root)?;
        tracing::info!(
            root = %root.display(),
            directories = backend.armed.len(),
            subscribers = self.handlers.len(),
            "watch engine armed",
        );
        let backend: SharedBackend = Arc::new(Mutex::new(Some(backend)));

        let hub = Arc::new(FanOut::<EventResult>::new(self.buffer_size));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        for handler in self.handlers {
            let mut queue = hub.subscribe();
            tracker.spawn_on(
                async move {
                    while let Some(event) = queue.recv().await {
                        handler.on_event(event).await;
                    }
                },
                &runtime,
            );
        }

        tracker.spawn_on(
            fan_out_task(root.clone(), raw_rx, hub, backend.clone(), cancel.clone()),
            &runtime,
        );
        tracker.close();

        Ok(Watcher {
            root,
            backend,
            cancel,
            tracker,
        })
    }
}

/// Handle to a running watch engine.
pub struct Watcher {
    root: PathBuf,
    backend: SharedBackend,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Watcher {
    pub fn builder(root: impl Into<PathBuf>) -> WatcherBuilder {
        WatcherBuilder {
            root: root.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            handlers: Vec::new(),
        }
    }

    /// Canonical watched root; event names are relative to it.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop watching, deliver the terminal exit event to every subscriber and
    /// wait for all dispatch tasks to drain. Safe to call more than once.
    pub async fn close(&self) {
        let backend = self
            .backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if backend.is_some() {
            tracing::debug!(root = %self.root.display(), "closing watch engine");
        }
        drop(backend);

        self.cancel.cancel();
        self.tracker.wait().await;
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn fan_out_task(
    root: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    hub: Arc<FanOut<EventResult>>,
    backend: SharedBackend,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "watch backend error");
                hub.publish(Err(EventError::from(&err))).await;
                continue;
            }
        };

        for (path, op) in translate(&raw) {
            let Some(name) = relative_key(&root, &path) else {
                continue;
            };
            track_directories(&backend, &path, op);
            hub.publish(Ok(Event::new(name, op))).await;
        }
    }

    hub.publish(Ok(Event::exit())).await;
    hub.close();
    tracing::debug!(root = %root.display(), "watch fan-out stopped");
}

/// Map one raw notification onto `(path, op)` pairs; kinds that carry no
/// content change yield nothing.
fn translate(raw: &notify::Event) -> Vec<(PathBuf, Op)> {
    let paths = raw.paths.iter().filter(|p| !p.as_os_str().is_empty());
    let op = match raw.kind {
        EventKind::Create(_) => Op::CREATE,
        EventKind::Modify(ModifyKind::Metadata(_)) => Op::CHMOD,
        // The destination of a move arrives with its content already in place.
        EventKind::Modify(ModifyKind::Name(mode)) => {
            return match mode {
                RenameMode::From => paths.map(|p| (p.clone(), Op::RENAME)).collect(),
                RenameMode::To => paths.map(|p| (p.clone(), MOVED_IN)).collect(),
                RenameMode::Both => paths
                    .enumerate()
                    .map(|(i, p)| (p.clone(), if i == 0 { Op::RENAME } else { MOVED_IN }))
                    .collect(),
                RenameMode::Any | RenameMode::Other => paths
                    .map(|p| {
                        let op = if p.exists() { MOVED_IN } else { Op::RENAME };
                        (p.clone(), op)
                    })
                    .collect(),
            };
        }
        EventKind::Modify(_) => Op::WRITE,
        EventKind::Remove(_) => Op::REMOVE,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    paths.map(|p| (p.clone(), op)).collect()
}

/// Arm directories that just appeared and forget ones that went away.
fn track_directories(backend: &SharedBackend, path: &Path, op: Op) {
    let mut guard = backend.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(backend) = guard.as_mut() else {
        return;
    };

    if op.intersects(Op::REMOVE | Op::RENAME) {
        backend.armed.retain(|dir| !dir.starts_with(path));
        return;
    }
    if !op.contains(Op::CREATE) {
        return;
    }

    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            if let Err(err) = arm_tree(backend, path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to arm new directory");
            }
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "stat after create failed");
        }
    }
}

fn arm_tree(backend: &mut Backend, root: &Path) -> Result<(), WatchError> {
    for dir in collect_dirs(root)? {
        if backend.armed.insert(dir.clone()) {
            if let Err(err) = backend.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                backend.armed.remove(&dir);
                return Err(err.into());
            }
            tracing::debug!(path = %dir.display(), "watching directory");
        }
    }
    Ok(())
}

fn collect_dirs(root: &Path) -> Result<Vec<PathBuf>, WatchError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound && cursor > 1 => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                dirs.push(entry.path());
            }
        }
    }
    Ok(dirs)
}
