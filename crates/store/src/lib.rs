// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::len_without_is_empty, clippy::new_without_default)]

//! Content-addressed storage of filesystem trees and source blobs (spec §4.1).
//!
//! Layout on disk, rooted at the store directory:
//!
//! ```text
//! objects/<id>/            committed, read-only trees, keyed by ObjectId
//! refs/<name>               human-readable pointers to object identifiers
//! sources/<source-type>/<hash>   immutable blobs fetched by a Source
//! tmp/                       scratch: staged objects, snapshots, mkdtemp allocations
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use fs2::FileExt;
use hashing::Fingerprint;

mod clone;
pub mod sources;

pub use clone::clone_tree;
pub use sources::{FetchRequest, SourceFetcher, SourceOutcome};

/// Errors surfaced by the object store (spec §7: `StorageFull`, `StoreCorrupt`, `SourceInvalid`).
#[derive(Debug)]
pub enum StoreError {
    /// Out of space while staging or committing an object.
    StorageFull(String),
    /// The store directory is in an inconsistent state (permission errors during commit, a
    /// `refs/` entry pointing at a missing object, etc).
    StoreCorrupt(String),
    /// A source blob's content did not hash to its filename.
    SourceInvalid(String),
    /// The requested object identifier has no committed object.
    NotFound(String),
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::StorageFull(msg) => write!(f, "storage full: {msg}"),
            StoreError::StoreCorrupt(msg) => write!(f, "store corrupt: {msg}"),
            StoreError::SourceInvalid(msg) => write!(f, "source invalid: {msg}"),
            StoreError::NotFound(msg) => write!(f, "object not found: {msg}"),
            StoreError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::OutOfMemory => StoreError::StorageFull(e.to_string()),
            io::ErrorKind::PermissionDenied => StoreError::StoreCorrupt(e.to_string()),
            _ if e.raw_os_error() == Some(libc_enospc()) => StoreError::StorageFull(e.to_string()),
            _ => StoreError::Io(e.to_string()),
        }
    }
}

// Avoid a direct `libc` dependency just for one errno constant; ENOSPC is stable across Unixes
// that this engine targets.
fn libc_enospc() -> i32 {
    28
}

/// The deterministic identifier of a committed object: a 256-bit hash of a stage invocation
/// (spec §3: `H(stage-name, canonical(options), sorted(input-ids), upstream-id)`).
///
/// Computing the hash from a stage invocation is the planner's job (`planner::compile`); this
/// type is just the store's cache key.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct ObjectId(pub Fingerprint);

impl ObjectId {
    pub fn from_fingerprint(fingerprint: Fingerprint) -> ObjectId {
        ObjectId(fingerprint)
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s).map(ObjectId)
    }
}

/// A writable, as-yet-uncommitted object tree (spec §4.1: `new_object`/`commit`).
///
/// Backed by a `tempfile::TempDir`: if this value is dropped without being passed to
/// [`Store::commit`], the directory (and everything a stage wrote into it) is removed, which is
/// exactly the "staged object not committed within its owning stage's lifetime must be removed"
/// invariant (spec §3) and testable property 5 (cleanup).
pub struct StagedObject {
    dir: Option<tempfile::TempDir>,
    path: PathBuf,
}

impl StagedObject {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adopt a [`Snapshot`] as a staged object, so a writable clone of an already-committed
    /// object can itself be committed under a new identifier (the executor's "next stage writes
    /// on top of the previous stage's tree" case, spec §4.4 step 2).
    pub fn from_snapshot(snapshot: Snapshot) -> StagedObject {
        let path = snapshot.dir.path().to_path_buf();
        StagedObject {
            dir: Some(snapshot.dir),
            path,
        }
    }
}

impl fmt::Debug for StagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedObject").field("path", &self.path).finish()
    }
}

/// A writable clone of a committed object (spec §4.1: `snapshot`), owned by the caller.
///
/// Like [`StagedObject`], cleanup is automatic: dropping a `Snapshot` removes its directory.
pub struct Snapshot {
    dir: tempfile::TempDir,
}

impl Snapshot {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("path", &self.dir.path()).finish()
    }
}

/// The object store handle. Cheaply cloneable; all mutable state (the reflink capability cache)
/// is behind a `Mutex`, the same `Arc<Mutex<_>>`-light-state pattern the teacher's `ByteStore`
/// uses for its own small bits of shared, rarely-contended state.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    reflink_capable: std::sync::Arc<Mutex<Option<bool>>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("root", &self.root).finish()
    }
}

impl Store {
    /// Open (creating if necessary) a store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Store, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs"))?;
        fs::create_dir_all(root.join("sources"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Store {
            root,
            reflink_capable: std::sync::Arc::new(Mutex::new(None)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    fn sources_root(&self) -> PathBuf {
        self.root.join("sources")
    }

    fn lock(&self, name: &str) -> Result<fs::File, StoreError> {
        let path = self.root.join(name);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    /// Allocate a staged, writable object directory (spec §4.1: `new_object`).
    pub fn new_object(&self) -> Result<StagedObject, StoreError> {
        let _lock = self.lock("tmp/.lock")?;
        let dir = tempfile::Builder::new()
            .prefix("staged-")
            .tempdir_in(self.tmp_dir())?;
        let path = dir.path().to_path_buf();
        Ok(StagedObject {
            dir: Some(dir),
            path,
        })
    }

    /// Commit a staged object under `id` (spec §4.1: `commit`).
    ///
    /// Idempotent on an `id` collision: the fresh copy is discarded and the already-committed
    /// object wins, returning its path either way.
    pub fn commit(&self, mut staged: StagedObject, id: ObjectId) -> Result<PathBuf, StoreError> {
        let _lock = self.lock("objects/.lock")?;
        let dest = self.objects_dir().join(id.to_hex());
        if dest.exists() {
            log::debug!("object {id} already committed; discarding fresh copy");
            return Ok(dest);
        }
        let staged_path = staged
            .dir
            .take()
            .map(tempfile::TempDir::into_path)
            .unwrap_or_else(|| staged.path.clone());
        fs::rename(&staged_path, &dest)?;
        make_tree_read_only(&dest)?;
        log::info!("committed object {id}");
        Ok(dest)
    }

    /// Cache lookup (spec §4.1: `contains`).
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects_dir().join(id.to_hex()).is_dir()
    }

    /// Path to a committed object's tree, or `StoreError::NotFound`.
    pub fn object_path(&self, id: ObjectId) -> Result<PathBuf, StoreError> {
        let path = self.objects_dir().join(id.to_hex());
        if path.is_dir() {
            Ok(path)
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    /// Produce a writable clone of a committed object (spec §4.1: `snapshot`).
    pub fn snapshot(&self, id: ObjectId) -> Result<Snapshot, StoreError> {
        let src = self.object_path(id)?;
        let dir = tempfile::Builder::new()
            .prefix("snapshot-")
            .tempdir_in(self.tmp_dir())?;
        clone::clone_tree(&src, dir.path(), &self.reflink_capable)?;
        Ok(Snapshot { dir })
    }

    /// The per-source-type blob directory, creating it if necessary (spec §4.1: `source`).
    pub fn source(&self, source_type: &str) -> Result<PathBuf, StoreError> {
        let dir = self.sources_root().join(source_type);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Allocate a caller-owned scratch directory inside `parent` (spec §4.1: `mkdtemp`).
    ///
    /// `parent` is the current sandbox's temp root, passed down by the Host API server rather
    /// than looked up globally, so the store stays ignorant of which invocation is asking.
    pub fn mkdtemp(&self, parent: &Path, prefix: &str) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?;
        Ok(dir.into_path())
    }

    /// Record a human-readable pointer to an object identifier (not part of the Host API; used
    /// by the planner/executor to expose e.g. a manifest's named top-level pipeline result).
    pub fn set_ref(&self, name: &str, id: ObjectId) -> Result<(), StoreError> {
        fs::write(self.refs_dir().join(name), id.to_string())?;
        Ok(())
    }

    pub fn get_ref(&self, name: &str) -> Result<ObjectId, StoreError> {
        let contents = fs::read_to_string(self.refs_dir().join(name))
            .map_err(|_| StoreError::NotFound(format!("ref {name:?}")))?;
        contents
            .trim()
            .parse()
            .map_err(|e| StoreError::StoreCorrupt(format!("ref {name:?}: {e}")))
    }
}

fn make_tree_read_only(root: &Path) -> Result<(), StoreError> {
    for entry in walkdir::WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
        let mut perms = entry.metadata().map_err(|e| StoreError::Io(e.to_string()))?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(entry.path(), perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
