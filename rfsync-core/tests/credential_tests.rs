//! Credential store persistence and session-binding tests.

use std::fs;
use std::net::IpAddr;

use rfsync_core::{CredentialError, CredentialStore};
use tempfile::TempDir;

const TEST_COST: u32 = 4;

fn ip(s: &str) -> IpAddr {
    s.parse().expect("ip")
}

fn store_with_alice(dir: &TempDir) -> CredentialStore {
    let store = CredentialStore::open(dir.path().join("users"))
        .expect("open")
        .with_cost(TEST_COST);
    store.create_user("alice", "wonderland").expect("create alice");
    store
}

#[test]
fn open_creates_missing_file_with_owner_only_mode() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("users");
    let store = CredentialStore::open(&path).expect("open");
    assert!(path.exists());
    assert!(store.usernames().is_empty());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

#[test]
fn created_user_survives_reload() {
    let dir = TempDir::new().expect("tempdir");
    store_with_alice(&dir);

    let reloaded = CredentialStore::open(dir.path().join("users")).expect("reopen");
    assert_eq!(reloaded.usernames(), vec!["alice".to_string()]);
    assert!(reloaded.check_password("alice", "wonderland"));
    assert!(!reloaded.check_password("alice", "looking-glass"));
    assert!(!reloaded.check_password("mallory", "wonderland"));

    let contents = fs::read_to_string(dir.path().join("users")).expect("read");
    assert!(contents.starts_with("alice:$2"), "bcrypt record expected: {contents}");
}

#[test]
fn duplicate_and_invalid_usernames_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_with_alice(&dir);

    assert!(matches!(
        store.create_user("alice", "again"),
        Err(CredentialError::UsernameExists(_))
    ));
    assert!(matches!(
        store.create_user("9lives", "x"),
        Err(CredentialError::InvalidUsername(_))
    ));
}

#[test]
fn delete_rewrites_file_without_user() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_with_alice(&dir);
    store.create_user("bob", "builder").expect("create bob");

    assert!(store.delete_user("alice").expect("delete"));
    assert!(!store.delete_user("alice").expect("second delete"));

    let reloaded = CredentialStore::open(dir.path().join("users")).expect("reopen");
    assert_eq!(reloaded.usernames(), vec!["bob".to_string()]);
    assert!(!dir.path().join("users.tmp").exists());
}

#[test]
fn malformed_file_fails_to_open() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("users");
    fs::write(&path, "alice:$2b$04$abc\nnot-a-record\n").expect("write");

    let err = CredentialStore::open(&path).err().expect("error");
    assert!(matches!(err, CredentialError::Format { line: 2, .. }), "got: {err}");
}

#[test]
fn binding_is_exclusive_per_ip_until_released() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_with_alice(&dir);

    assert!(store.set_authenticated_user("alice", ip("10.0.0.1")));
    assert!(store.check_ip("alice", ip("10.0.0.1")));
    assert!(!store.check_ip("alice", ip("10.0.0.2")));

    assert!(!store.set_authenticated_user("alice", ip("10.0.0.2")), "collision");

    store.unset_authenticated_user("alice");
    assert!(store.set_authenticated_user("alice", ip("10.0.0.2")));
}

#[test]
fn same_ip_connections_share_binding() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_with_alice(&dir);

    assert!(store.set_authenticated_user("alice", ip("10.0.0.1")));
    assert!(store.set_authenticated_user("alice", ip("10.0.0.1")));

    store.unset_authenticated_user("alice");
    assert!(
        !store.set_authenticated_user("alice", ip("10.0.0.9")),
        "one connection from the bound ip is still open"
    );

    store.unset_authenticated_user("alice");
    assert!(store.set_authenticated_user("alice", ip("10.0.0.9")));
}

#[test]
fn recreated_user_keeps_binding_held_by_earlier_connection() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_with_alice(&dir);
    assert!(store.set_authenticated_user("alice", ip("10.0.0.1")));

    assert!(store.delete_user("alice").expect("delete"));
    store.create_user("alice", "again").expect("recreate");
    assert!(store.set_authenticated_user("alice", ip("10.0.0.1")));

    // The pre-delete connection closes; the new one must stay bound.
    store.unset_authenticated_user("alice");
    assert!(store.check_ip("alice", ip("10.0.0.1")));
    assert!(!store.set_authenticated_user("alice", ip("10.0.0.2")));

    store.unset_authenticated_user("alice");
    assert!(store.set_authenticated_user("alice", ip("10.0.0.2")));
}

#[test]
fn unknown_user_cannot_bind() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_with_alice(&dir);
    assert!(!store.set_authenticated_user("mallory", ip("10.0.0.1")));
}
