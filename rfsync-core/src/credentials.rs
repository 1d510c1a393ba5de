//! Credential store: bcrypt password file plus live session bindings.
//!
//! # File format
//!
//! ```text
//! alice:$2b$12$....
//! bob:$2b$12$....
//! ```
//!
//! One `username:bcryptHash` record per line, mode `0600`. New users are
//! appended; deletion rewrites the file through a `.tmp` sibling + rename.
//!
//! # Sessions
//!
//! A username is bound to at most one source IP at a time. Connections from
//! the bound IP share the binding (a client keeps a subscription stream open
//! while it opens short-lived download sessions); the binding is released
//! when the last of them closes.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::error::{credential_io, CredentialError};

const COLUMN_SEP: char = ':';

#[derive(Debug, Clone, Copy)]
struct Binding {
    ip: IpAddr,
    connections: usize,
}

pub struct CredentialStore {
    path: PathBuf,
    cost: u32,
    users: RwLock<HashMap<String, String>>,
    sessions: Mutex<HashMap<String, Binding>>,
}

impl CredentialStore {
    /// Load the password file at `path`, creating it empty if absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        if !path.exists() {
            fs::write(&path, b"").map_err(|e| credential_io(&path, e))?;
            set_file_permissions(&path)?;
        }

        let contents = fs::read_to_string(&path).map_err(|e| credential_io(&path, e))?;
        let users = parse_records(&path, &contents)?;
        tracing::debug!(path = %path.display(), users = users.len(), "loaded password file");

        Ok(Self {
            path,
            cost: bcrypt::DEFAULT_COST,
            users: RwLock::new(users),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Override the bcrypt cost used for newly created users.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Known usernames, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_users().keys().cloned().collect();
        names.sort();
        names
    }

    /// Hash `password` and append a new record for `username`.
    pub fn create_user(&self, username: &str, password: &str) -> Result<(), CredentialError> {
        if !is_valid_username(username) {
            return Err(CredentialError::InvalidUsername(username.to_string()));
        }
        if self.read_users().contains_key(username) {
            return Err(CredentialError::UsernameExists(username.to_string()));
        }

        let hash = bcrypt::hash(password, self.cost)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| credential_io(&self.path, e))?;
        writeln!(file, "{username}{COLUMN_SEP}{hash}").map_err(|e| credential_io(&self.path, e))?;

        self.write_users().insert(username.to_string(), hash);
        tracing::info!(username, "created user");
        Ok(())
    }

    /// Remove `username` from the file. Returns `false` if it was not present.
    pub fn delete_user(&self, username: &str) -> Result<bool, CredentialError> {
        // A live session binding stays until its connections release it.
        if self.write_users().remove(username).is_none() {
            return Ok(false);
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| credential_io(&self.path, e))?;
        let kept: String = contents
            .lines()
            .filter(|line| match line.split_once(COLUMN_SEP) {
                Some((name, hash)) => name != username && !name.is_empty() && !hash.is_empty(),
                None => false,
            })
            .map(|line| format!("{line}\n"))
            .collect();

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, kept).map_err(|e| credential_io(&tmp, e))?;
        set_file_permissions(&tmp)?;
        fs::rename(&tmp, &self.path).map_err(|e| credential_io(&self.path, e))?;
        tracing::info!(username, "deleted user");
        Ok(true)
    }

    /// `true` when `username` exists and `password` matches its hash.
    ///
    /// bcrypt is deliberately slow; async callers should run this on a
    /// blocking worker.
    pub fn check_password(&self, username: &str, password: &str) -> bool {
        let Some(hash) = self.read_users().get(username).cloned() else {
            return false;
        };
        bcrypt::verify(password, &hash).unwrap_or(false)
    }

    /// `true` when `username` currently holds a session bound to `ip`.
    pub fn check_ip(&self, username: &str, ip: IpAddr) -> bool {
        self.lock_sessions()
            .get(username)
            .is_some_and(|binding| binding.ip == ip)
    }

    /// Bind `username` to `ip` for one connection.
    ///
    /// Returns `false` for unknown users and when the username is already
    /// bound to a different IP.
    pub fn set_authenticated_user(&self, username: &str, ip: IpAddr) -> bool {
        if !self.read_users().contains_key(username) {
            return false;
        }
        let mut sessions = self.lock_sessions();
        match sessions.get_mut(username) {
            Some(binding) if binding.ip == ip => {
                binding.connections += 1;
                true
            }
            Some(_) => false,
            None => {
                sessions.insert(
                    username.to_string(),
                    Binding {
                        ip,
                        connections: 1,
                    },
                );
                true
            }
        }
    }

    /// Release one connection's hold on the binding of `username`.
    pub fn unset_authenticated_user(&self, username: &str) {
        let mut sessions = self.lock_sessions();
        if let Some(binding) = sessions.get_mut(username) {
            binding.connections = binding.connections.saturating_sub(1);
            if binding.connections == 0 {
                sessions.remove(username);
            }
        }
    }

    fn read_users(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_users(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Binding>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_records(path: &Path, contents: &str) -> Result<HashMap<String, String>, CredentialError> {
    let mut users = HashMap::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split(COLUMN_SEP);
        match (fields.next(), fields.next(), fields.next()) {
            (Some(name), Some(hash), None) if !name.is_empty() && !hash.is_empty() => {
                users.insert(name.to_string(), hash.to_string());
            }
            _ => {
                return Err(CredentialError::Format {
                    path: path.to_path_buf(),
                    line: index + 1,
                })
            }
        }
    }
    Ok(users)
}

/// `^[A-Za-z][A-Za-z0-9_]*$`
fn is_valid_username(username: &str) -> bool {
    let mut chars = username.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CredentialError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| credential_io(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CredentialError> {
    Ok(())
}
