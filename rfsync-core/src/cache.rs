//! Metadata cache: in-memory mirror of the regular files below a root.
//!
//! The key space is exactly the set of regular files believed to exist under
//! the root, keyed by their root-relative `/`-separated name. Directories are
//! never entries. Readers (`lookup`, `list_all`) share a read lock; event
//! application and file mutations take the write lock only to patch the map.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{cache_io, CacheError};
use crate::event::{Event, Op};

/// Size and modification time of one regular file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub modify_time: DateTime<Utc>,
}

pub struct MetadataCache {
    root: PathBuf,
    entries: RwLock<HashMap<String, FileMeta>>,
}

impl MetadataCache {
    /// Walk `root` and index every regular file below it.
    ///
    /// Any directory that cannot be read aborts construction.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref();
        let root = fs::canonicalize(root).map_err(|e| cache_io(root, e))?;
        if !root.is_dir() {
            return Err(CacheError::NotADirectory { path: root });
        }

        let mut entries = HashMap::new();
        walk_files(&root, &root, &mut entries)?;
        tracing::info!(root = %root.display(), files = entries.len(), "metadata cache built");

        Ok(Self {
            root,
            entries: RwLock::new(entries),
        })
    }

    /// Canonical root every name is relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Point lookup; `name` may be root-relative or an absolute path under the root.
    pub fn lookup(&self, name: &str) -> Option<FileMeta> {
        let name = self.relative_name(name).ok()?;
        self.read_entries().get(&name).cloned()
    }

    /// Snapshot of every entry, sorted by name.
    pub fn list_all(&self) -> Vec<FileMeta> {
        let mut files: Vec<FileMeta> = self.read_entries().values().cloned().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    /// Patch the cache from one watch event.
    ///
    /// Noise (swap/backup files, pure chmod) and the terminal exit event are
    /// ignored. Remove/Rename drop the entry (and any entries below it when a
    /// directory disappears); anything else re-stats the path.
    pub fn apply_event(&self, event: &Event) {
        if event.is_exit() || event.is_noise() {
            return;
        }
        let name = match self.relative_name(&event.name) {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(event = %event, error = %err, "ignoring event with invalid name");
                return;
            }
        };

        if event.op.intersects(Op::REMOVE | Op::RENAME) {
            let removed = self.forget(&name);
            tracing::debug!(name = %name, removed, op = %event.op, "dropped cache entries");
            return;
        }

        let path = self.root.join(&name);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.forget(&name);
                return;
            }
            Err(err) => {
                tracing::warn!(event = %event, error = %err, "stat failed while applying event");
                return;
            }
        };

        if meta.is_dir() {
            // A directory moved or copied in wholesale brings its files along.
            let mut found = HashMap::new();
            if let Err(err) = walk_files(&self.root, &path, &mut found) {
                tracing::warn!(event = %event, error = %err, "walk of new directory failed");
            }
            if !found.is_empty() {
                self.write_entries().extend(found);
            }
            return;
        }

        if meta.is_file() {
            let entry = file_meta(name.clone(), &meta);
            let previous = self.write_entries().insert(name.clone(), entry);
            if previous.is_some() {
                tracing::debug!(name = %name, op = %event.op, "updated file metadata");
            } else {
                tracing::debug!(name = %name, op = %event.op, "new file metadata");
            }
        }
    }

    /// Re-stat `name` and upsert what is there now, returning the fresh metadata.
    ///
    /// A regular file yields its own entry. A directory is walked and yields
    /// every regular file below it, sorted by name. A vanished path drops its
    /// entries and yields nothing.
    pub fn refresh_tree(&self, name: &str) -> Vec<FileMeta> {
        let Ok(name) = self.relative_name(name) else {
            return Vec::new();
        };
        let path = self.root.join(&name);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                let entry = file_meta(name.clone(), &meta);
                self.write_entries().insert(name, entry.clone());
                vec![entry]
            }
            Ok(meta) if meta.is_dir() => {
                let mut found = HashMap::new();
                if let Err(err) = walk_files(&self.root, &path, &mut found) {
                    tracing::warn!(name = %name, error = %err, "walk during refresh failed");
                }
                let mut files: Vec<FileMeta> = found.values().cloned().collect();
                files.sort_by(|a, b| a.name.cmp(&b.name));
                self.write_entries().extend(found);
                files
            }
            Ok(_) => Vec::new(),
            Err(_) => {
                self.forget(&name);
                Vec::new()
            }
        }
    }

    /// Write `data` to `name` under the root, creating parent directories.
    ///
    /// The content lands in a `~`-suffixed sibling first and is renamed into
    /// place, so watchers never mirror a half-written file.
    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<FileMeta, CacheError> {
        let name = self.relative_name(name)?;
        let path = self.root.join(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| cache_io(parent, e))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.part~"));
        fs::write(&tmp, data).map_err(|e| cache_io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| cache_io(&path, e))?;

        let meta = fs::metadata(&path).map_err(|e| cache_io(&path, e))?;
        let entry = file_meta(name.clone(), &meta);
        self.write_entries().insert(name, entry.clone());
        Ok(entry)
    }

    /// Stamp `name` with `time` as its modification time and refresh its entry.
    pub fn set_modify_time(&self, name: &str, time: DateTime<Utc>) -> Result<FileMeta, CacheError> {
        let name = self.relative_name(name)?;
        let path = self.root.join(&name);
        let file = fs::File::options()
            .write(true)
            .open(&path)
            .map_err(|e| cache_io(&path, e))?;
        file.set_modified(SystemTime::from(time))
            .map_err(|e| cache_io(&path, e))?;
        let meta = file.metadata().map_err(|e| cache_io(&path, e))?;

        let entry = file_meta(name.clone(), &meta);
        self.write_entries().insert(name, entry.clone());
        Ok(entry)
    }

    /// Read a tracked file. Names unknown to the cache are refused even when
    /// they exist on disk.
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>, CacheError> {
        let name = self.relative_name(name)?;
        if !self.read_entries().contains_key(&name) {
            return Err(CacheError::NotTracked { name });
        }
        let path = self.root.join(&name);
        fs::read(&path).map_err(|e| cache_io(path, e))
    }

    /// Delete `name` (file or directory tree) under the root. Already-missing
    /// paths are not an error.
    pub fn remove_file(&self, name: &str) -> Result<(), CacheError> {
        let name = self.relative_name(name)?;
        let path = self.root.join(&name);
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(cache_io(path, err)),
        }
        self.forget(&name);
        Ok(())
    }

    fn relative_name(&self, name: &str) -> Result<String, CacheError> {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            if let Ok(stripped) = candidate.strip_prefix(&self.root) {
                return normalize_name(&stripped.to_string_lossy());
            }
        }
        normalize_name(name)
    }

    /// Drop `name` and every entry below it; returns how many were removed.
    fn forget(&self, name: &str) -> usize {
        let prefix = format!("{name}/");
        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|key, _| key != name && !key.starts_with(&prefix));
        before - entries.len()
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, FileMeta>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, FileMeta>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Canonical cache key for `name`: root-relative, `/`-separated, with leading
/// `./` and `/` stripped. Empty names and `..` components are rejected.
pub fn normalize_name(name: &str) -> Result<String, CacheError> {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(CacheError::InvalidName {
                    name: name.to_string(),
                })
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(CacheError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(parts.join("/"))
}

fn file_meta(name: String, meta: &fs::Metadata) -> FileMeta {
    FileMeta {
        name,
        size: meta.len(),
        modify_time: meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now()),
    }
}

/// Root-relative, `/`-separated name of `path`; `None` for the root itself
/// and for paths outside it.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn walk_files(
    root: &Path,
    start: &Path,
    out: &mut HashMap<String, FileMeta>,
) -> Result<(), CacheError> {
    let mut dirs = vec![start.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| cache_io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| cache_io(&dir, e))?;
            let path = entry.path();
            let ty = entry.file_type().map_err(|e| cache_io(&path, e))?;
            if ty.is_dir() {
                dirs.push(path);
                continue;
            }
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                // Dangling symlink or a file removed mid-walk.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(cache_io(&path, err)),
            };
            if !meta.is_file() {
                continue;
            }
            if let Some(name) = relative_key(root, &path) {
                out.insert(name.clone(), file_meta(name, &meta));
            }
        }
    }
    Ok(())
}
