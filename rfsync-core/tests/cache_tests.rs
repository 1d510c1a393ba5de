//! Metadata cache construction, event application and file operations.

use std::fs;

use assert_fs::prelude::*;
use rfsync_core::{CacheError, Event, MetadataCache, Op};
use rstest::rstest;

fn populated_root() -> assert_fs::TempDir {
    let root = assert_fs::TempDir::new().expect("tempdir");
    root.child("a.txt").write_str("hello").expect("write a");
    root.child("docs/b.md").write_str("# title\n").expect("write b");
    root.child("docs/deep/c.bin").write_binary(&[0u8; 32]).expect("write c");
    root.child("empty-dir").create_dir_all().expect("mkdir");
    root
}

// ---------------------------------------------------------------------------
// 1. Construction
// ---------------------------------------------------------------------------

#[test]
fn walk_indexes_regular_files_only() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    let names: Vec<String> = cache.list_all().into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["a.txt", "docs/b.md", "docs/deep/c.bin"]);
    assert_eq!(cache.lookup("docs/deep/c.bin").expect("c").size, 32);
    assert!(cache.lookup("empty-dir").is_none(), "directories are not entries");
}

#[test]
fn missing_root_fails_construction() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let err = MetadataCache::new(root.path().join("nope")).err().expect("error");
    assert!(matches!(err, CacheError::Io { .. }), "got: {err}");
}

#[test]
fn file_root_fails_construction() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    root.child("plain").write_str("x").expect("write");
    let err = MetadataCache::new(root.path().join("plain")).err().expect("error");
    assert!(matches!(err, CacheError::NotADirectory { .. }), "got: {err}");
}

#[test]
fn lookup_accepts_relative_markers_and_absolute_paths() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    assert!(cache.lookup("./a.txt").is_some());
    assert!(cache.lookup("/docs/b.md").is_some());
    let absolute = cache.root().join("docs").join("b.md");
    assert!(cache.lookup(&absolute.to_string_lossy()).is_some());
}

// ---------------------------------------------------------------------------
// 2. Event application
// ---------------------------------------------------------------------------

#[test]
fn create_write_remove_sequence_tracks_last_state() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let cache = MetadataCache::new(root.path()).expect("cache");

    root.child("new.txt").touch().expect("touch");
    cache.apply_event(&Event::new("new.txt", Op::CREATE));
    assert_eq!(cache.lookup("new.txt").expect("created").size, 0);

    root.child("new.txt").write_str("0123456789").expect("write");
    cache.apply_event(&Event::new("new.txt", Op::WRITE));
    assert_eq!(cache.lookup("new.txt").expect("written").size, 10);

    fs::remove_file(root.child("new.txt").path()).expect("rm");
    cache.apply_event(&Event::new("new.txt", Op::REMOVE));
    assert!(cache.lookup("new.txt").is_none());
}

#[test]
fn rename_drops_entry_even_if_file_still_exists() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    cache.apply_event(&Event::new("a.txt", Op::RENAME));
    assert!(cache.lookup("a.txt").is_none());
}

#[test]
fn removing_directory_drops_entries_below_it() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    cache.apply_event(&Event::new("docs", Op::REMOVE));
    assert!(cache.lookup("docs/b.md").is_none());
    assert!(cache.lookup("docs/deep/c.bin").is_none());
    assert!(cache.lookup("a.txt").is_some());
}

#[test]
fn created_directory_with_files_is_indexed() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let cache = MetadataCache::new(root.path()).expect("cache");

    root.child("moved/in/x.txt").write_str("xx").expect("write");
    cache.apply_event(&Event::new("moved", Op::CREATE));
    assert_eq!(cache.lookup("moved/in/x.txt").expect("indexed").size, 2);
}

#[test]
fn ignored_events_never_mutate_the_cache() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");
    let before = cache.list_all();

    root.child(".a.txt.swp").write_str("swap").expect("write swap");
    root.child("a.txt~").write_str("backup").expect("write backup");
    cache.apply_event(&Event::new(".a.txt.swp", Op::CREATE));
    cache.apply_event(&Event::new("a.txt~", Op::WRITE));
    cache.apply_event(&Event::new("a.txt", Op::CHMOD));
    cache.apply_event(&Event::exit());

    assert_eq!(cache.list_all(), before);
}

#[test]
fn refresh_tree_reports_every_file_of_an_arrived_directory() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let cache = MetadataCache::new(root.path()).expect("cache");
    root.child("moved/f.txt").write_str("five!").expect("write f");
    root.child("moved/sub/g.txt").write_str("g").expect("write g");

    let names: Vec<String> = cache.refresh_tree("moved").into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["moved/f.txt", "moved/sub/g.txt"]);
    assert_eq!(cache.lookup("moved/f.txt").expect("indexed").size, 5);

    let single = cache.refresh_tree("moved/f.txt");
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].name, "moved/f.txt");

    fs::remove_dir_all(root.path().join("moved")).expect("rm");
    assert!(cache.refresh_tree("moved/f.txt").is_empty());
    assert!(cache.lookup("moved/f.txt").is_none());
}

#[test]
fn write_event_for_vanished_file_drops_entry() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    fs::remove_file(root.child("a.txt").path()).expect("rm");
    cache.apply_event(&Event::new("a.txt", Op::WRITE));
    assert!(cache.lookup("a.txt").is_none());
}

// ---------------------------------------------------------------------------
// 3. File operations
// ---------------------------------------------------------------------------

#[test]
fn write_file_creates_parents_and_refreshes_entry() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let cache = MetadataCache::new(root.path()).expect("cache");

    let meta = cache.write_file("nested/dir/f.txt", b"payload").expect("write");
    assert_eq!(meta.size, 7);
    root.child("nested/dir/f.txt").assert("payload");
    assert_eq!(cache.lookup("nested/dir/f.txt"), Some(meta));

    let leftovers: Vec<_> = fs::read_dir(root.child("nested/dir").path())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with('~'))
        .collect();
    assert!(leftovers.is_empty(), "temporary file must be renamed away");
}

#[test]
fn write_file_overwrites_existing_content() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    cache.write_file("a.txt", b"a much longer body").expect("overwrite");
    root.child("a.txt").assert("a much longer body");
    assert_eq!(cache.lookup("a.txt").expect("entry").size, 18);
}

#[test]
fn read_file_requires_tracked_entry() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    assert_eq!(cache.read_file("docs/b.md").expect("read"), b"# title\n");

    root.child("untracked.txt").write_str("secret").expect("write");
    let err = cache.read_file("untracked.txt").unwrap_err();
    assert!(matches!(err, CacheError::NotTracked { .. }), "got: {err}");
}

#[test]
fn path_traversal_is_rejected() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    assert!(matches!(
        cache.write_file("../escape.txt", b"x"),
        Err(CacheError::InvalidName { .. })
    ));
    assert!(matches!(
        cache.read_file("docs/../../etc/passwd"),
        Err(CacheError::InvalidName { .. })
    ));
    assert!(matches!(
        cache.remove_file(".."),
        Err(CacheError::InvalidName { .. })
    ));
}

#[test]
fn remove_file_deletes_from_disk_and_cache() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    cache.remove_file("a.txt").expect("remove");
    root.child("a.txt").assert(predicates::path::missing());
    assert!(cache.lookup("a.txt").is_none());

    cache.remove_file("docs").expect("remove dir");
    root.child("docs").assert(predicates::path::missing());
    assert!(cache.is_empty());

    cache.remove_file("never-existed.txt").expect("missing is fine");
}

#[test]
fn set_modify_time_stamps_disk_and_cache() {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");
    let stamp = chrono::DateTime::parse_from_rfc3339("2021-06-01T12:00:00Z")
        .expect("timestamp")
        .with_timezone(&chrono::Utc);

    let meta = cache.set_modify_time("a.txt", stamp).expect("stamp");
    assert_eq!(meta.modify_time, stamp);
    assert_eq!(cache.lookup("a.txt").expect("entry").modify_time, stamp);

    let on_disk = fs::metadata(root.child("a.txt").path())
        .expect("stat")
        .modified()
        .expect("mtime");
    assert_eq!(chrono::DateTime::<chrono::Utc>::from(on_disk), stamp);
}

#[rstest]
#[case("../escape.txt")]
#[case("docs/../../escape.txt")]
#[case("")]
#[case("./")]
fn invalid_names_are_refused_by_every_file_operation(#[case] name: &str) {
    let root = populated_root();
    let cache = MetadataCache::new(root.path()).expect("cache");

    assert!(matches!(cache.write_file(name, b"x"), Err(CacheError::InvalidName { .. })));
    assert!(matches!(cache.read_file(name), Err(CacheError::InvalidName { .. })));
    assert!(matches!(cache.remove_file(name), Err(CacheError::InvalidName { .. })));
    assert_eq!(cache.len(), 3);
}
