//! # Volumes
//!
//! A volume is one opened tree bound to one file path. Two access modes
//! exist, chosen at open time:
//!
//! - [`Volume`]: single-threaded. The tree is owned directly and mutating
//!   operations take `&mut self`; there is no synchronization anywhere on
//!   the path of an operation.
//! - [`SharedVolume`]: one readers-writer lock at the volume boundary.
//!   `get`/`exist` take the shared side, `set`/`remove` the exclusive
//!   side. No finer-grained latching exists below it.
//!
//! Either kind holds a lease on its absolutized path in a process-wide
//! registry: opening a path that is already open anywhere in the process
//! fails with `AlreadyOpen` until the holder closes (or drops) its volume.
//! Closing also truncates the backing file to its written size.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use eyre::{Report, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::btree::BTree;
use crate::codec::{FixedKey, Value};
use crate::error::StoreError;

fn open_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN_PATHS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN_PATHS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Registry entry for one open path; releases itself on drop.
#[derive(Debug)]
struct PathLease {
    path: PathBuf,
}

impl PathLease {
    fn acquire(path: &Path) -> Result<Self> {
        let path = std::path::absolute(path)
            .wrap_err_with(|| format!("cannot resolve path '{}'", path.display()))?;

        let mut held = open_paths().lock();
        if !held.insert(path.clone()) {
            return Err(Report::new(StoreError::AlreadyOpen(path)));
        }
        Ok(Self { path })
    }
}

impl Drop for PathLease {
    fn drop(&mut self) {
        open_paths().lock().remove(&self.path);
    }
}

/// A single-threaded volume: plain ownership, no locks.
#[derive(Debug)]
pub struct Volume<K, V> {
    tree: BTree<K, V>,
    lease: PathLease,
}

impl<K: FixedKey, V: Value> Volume<K, V> {
    pub fn open<P: AsRef<Path>>(path: P, t: u16) -> Result<Self> {
        let lease = PathLease::acquire(path.as_ref())?;
        let tree = BTree::open(path.as_ref(), t)?;
        debug!(path = %lease.path.display(), t, "opened volume");
        Ok(Self { tree, lease })
    }

    pub fn path(&self) -> &Path {
        &self.lease.path
    }

    pub fn set(&mut self, key: K, value: V) -> Result<()> {
        self.tree.set(key, value)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.tree.get(key)
    }

    pub fn exist(&self, key: &K) -> Result<bool> {
        self.tree.exist(key)
    }

    pub fn remove(&mut self, key: &K) -> Result<bool> {
        self.tree.remove(key)
    }

    /// Closes the volume: shrinks the file and releases the path. Dropping
    /// the volume does the same; `close` only makes the point explicit.
    pub fn close(self) {
        debug!(path = %self.lease.path.display(), "closing volume");
    }
}

/// A volume safe to share across threads: the whole tree sits behind one
/// readers-writer lock.
pub struct SharedVolume<K, V> {
    tree: RwLock<BTree<K, V>>,
    lease: PathLease,
}

impl<K: FixedKey, V: Value> SharedVolume<K, V> {
    pub fn open<P: AsRef<Path>>(path: P, t: u16) -> Result<Self> {
        let lease = PathLease::acquire(path.as_ref())?;
        let tree = BTree::open(path.as_ref(), t)?;
        debug!(path = %lease.path.display(), t, "opened shared volume");
        Ok(Self {
            tree: RwLock::new(tree),
            lease,
        })
    }

    pub fn path(&self) -> &Path {
        &self.lease.path
    }

    pub fn set(&self, key: K, value: V) -> Result<()> {
        self.tree.write().set(key, value)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.tree.read().get(key)
    }

    pub fn exist(&self, key: &K) -> Result<bool> {
        self.tree.read().exist(key)
    }

    pub fn remove(&self, key: &K) -> Result<bool> {
        self.tree.write().remove(key)
    }

    pub fn close(self) {
        debug!(path = %self.lease.path.display(), "closing shared volume");
    }
}

/// Façade owning no state beyond the (K, V) configuration: a namespace for
/// opening and closing volumes of one tree type.
pub struct Storage<K, V> {
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<K: FixedKey, V: Value> Storage<K, V> {
    pub fn new() -> Self {
        Self { _kv: PhantomData }
    }

    pub fn open_volume<P: AsRef<Path>>(&self, path: P, t: u16) -> Result<Volume<K, V>> {
        Volume::open(path, t)
    }

    pub fn open_volume_shared<P: AsRef<Path>>(&self, path: P, t: u16) -> Result<SharedVolume<K, V>> {
        SharedVolume::open(path, t)
    }

    pub fn close_volume(&self, volume: Volume<K, V>) {
        volume.close();
    }

    pub fn close_shared_volume(&self, volume: SharedVolume<K, V>) {
        volume.close();
    }
}

impl<K: FixedKey, V: Value> Default for Storage<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
