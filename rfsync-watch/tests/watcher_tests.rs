use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rfsync_core::{Event, MetadataCache, Op};
use rfsync_watch::{CacheUpdater, EventHandler, EventResult, WatchError, Watcher};
use tempfile::TempDir;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    delay: Option<Duration>,
}

impl Recorder {
    fn slow(delay: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn ops_for(&self, name: &str) -> Vec<Op> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.name == name)
            .map(|e| e.op)
            .collect()
    }

    fn exit_count(&self) -> usize {
        self.snapshot().iter().filter(|e| e.is_exit()).count()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_event(&self, event: EventResult) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(event) = event {
            self.events.lock().unwrap().push(event);
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// `needle` appears in `haystack` in order, not necessarily contiguously.
fn is_subsequence(needle: &[Op], haystack: &[Op]) -> bool {
    let mut it = haystack.iter();
    needle.iter().all(|op| it.any(|seen| seen.contains(*op)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_subscriber_sees_the_same_sequence() {
    let dir = TempDir::new().unwrap();
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());

    let watcher = Watcher::builder(dir.path())
        .subscribe(first.clone())
        .subscribe(second.clone())
        .start()
        .unwrap();

    let file = dir.path().join("a.txt");
    fs::write(&file, b"hello").unwrap();
    wait_until(|| first.ops_for("a.txt").iter().any(|op| op.contains(Op::WRITE))).await;
    fs::remove_file(&file).unwrap();
    wait_until(|| second.ops_for("a.txt").iter().any(|op| op.contains(Op::REMOVE))).await;

    watcher.close().await;

    let ops = first.ops_for("a.txt");
    assert!(
        is_subsequence(&[Op::CREATE, Op::WRITE, Op::REMOVE], &ops),
        "unexpected sequence: {ops:?}"
    );
    assert_eq!(first.snapshot(), second.snapshot());
    assert_eq!(first.exit_count(), 1);
    assert_eq!(second.exit_count(), 1);
    assert!(first.snapshot().last().unwrap().is_exit());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn files_in_new_subdirectories_are_seen() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let watcher = Watcher::builder(dir.path())
        .subscribe(recorder.clone())
        .start()
        .unwrap();

    fs::create_dir(dir.path().join("docs")).unwrap();
    wait_until(|| !recorder.ops_for("docs").is_empty()).await;
    fs::write(dir.path().join("docs/b.txt"), b"nested").unwrap();
    wait_until(|| {
        recorder
            .ops_for("docs/b.txt")
            .iter()
            .any(|op| op.contains(Op::WRITE))
    })
    .await;

    watcher.close().await;

    assert_eq!(recorder.ops_for("docs"), vec![Op::CREATE]);
    assert!(recorder
        .ops_for("docs/b.txt")
        .iter()
        .any(|op| op.contains(Op::WRITE)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_updater_tracks_created_and_removed_files() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(MetadataCache::new(dir.path()).unwrap());
    let watcher = Watcher::builder(dir.path())
        .subscribe(Arc::new(CacheUpdater::new(cache.clone())))
        .start()
        .unwrap();

    fs::create_dir(dir.path().join("docs")).unwrap();
    fs::write(dir.path().join("docs/b.txt"), b"nested").unwrap();
    wait_until(|| cache.lookup("docs/b.txt").map(|m| m.size) == Some(6)).await;
    assert_eq!(cache.lookup("docs/b.txt").unwrap().size, 6);

    fs::remove_file(dir.path().join("docs/b.txt")).unwrap();
    wait_until(|| cache.lookup("docs/b.txt").is_none()).await;
    assert!(cache.lookup("docs/b.txt").is_none());

    watcher.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_returns_with_a_slow_subscriber_and_full_queue() {
    let dir = TempDir::new().unwrap();
    let slow = Arc::new(Recorder::slow(Duration::from_millis(20)));
    let fast = Arc::new(Recorder::default());

    let watcher = Watcher::builder(dir.path())
        .buffer_size(1)
        .subscribe(slow.clone())
        .subscribe(fast.clone())
        .start()
        .unwrap();

    for i in 0..10 {
        fs::write(dir.path().join(format!("f{i}.txt")), b"x").unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(20), watcher.close())
        .await
        .expect("close must not deadlock");

    assert_eq!(slow.exit_count(), 1);
    assert_eq!(fast.exit_count(), 1);
    assert!(slow.snapshot().last().unwrap().is_exit());
}

#[tokio::test]
async fn close_twice_is_harmless() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let watcher = Watcher::builder(dir.path())
        .subscribe(recorder.clone())
        .start()
        .unwrap();

    watcher.close().await;
    watcher.close().await;
    assert_eq!(recorder.exit_count(), 1);
}

#[tokio::test]
async fn swap_and_backup_files_still_reach_subscribers() {
    // Filtering is the consumers' job; the engine forwards everything.
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let watcher = Watcher::builder(dir.path())
        .subscribe(recorder.clone())
        .start()
        .unwrap();

    fs::write(dir.path().join("notes.txt~"), b"x").unwrap();
    wait_until(|| !recorder.ops_for("notes.txt~").is_empty()).await;
    watcher.close().await;

    assert!(!recorder.ops_for("notes.txt~").is_empty());
}

#[tokio::test]
async fn missing_root_fails_construction() {
    let dir = TempDir::new().unwrap();
    let err = Watcher::builder(dir.path().join("missing"))
        .start()
        .err()
        .expect("missing root must fail");
    assert!(matches!(err, WatchError::Io { .. }), "got: {err}");
}

#[tokio::test]
async fn file_root_fails_construction() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("plain.txt");
    fs::write(&file, b"x").unwrap();
    let err = Watcher::builder(&file).start().err().expect("file root must fail");
    assert!(matches!(err, WatchError::NotADirectory { .. }), "got: {err}");
}

#[test]
fn start_outside_runtime_is_rejected() {
    let dir = TempDir::new().unwrap();
    let err = Watcher::builder(dir.path())
        .start()
        .err()
        .expect("no runtime");
    assert!(matches!(err, WatchError::NoRuntime));
}
