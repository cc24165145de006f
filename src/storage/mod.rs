//!
//! echofiles storage module
//! ------------------------
//! Namespaced in-memory key/value stores, grouped per database under an optional root folder.
//! Each store can snapshot itself to `<root>/<db>/stores/<store>/snapshot.bin` (bincode) and
//! reload that snapshot on open.
//!
//! The public API centers around `SharedStore`, a cheap-to-clone handle passed to every
//! filestore operation and to the HTTP state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

pub mod kv;

pub use kv::{KvStore, KvStoresRegistry, KvValue, PersistenceSettings, StoreSettings};

#[derive(Clone)]
pub struct SharedStore {
    root: Option<PathBuf>,
    registry: Arc<KvStoresRegistry>,
}

impl SharedStore {
    /// Open (or reuse) the registry rooted at `root`. Snapshots are loaded on first access to
    /// each store; periodic snapshotting is off.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::open(root, false)
    }

    /// Like `new`; with `persist` the registry reports a snapshot cadence for
    /// `spawn_snapshot_loop`.
    pub fn open(root: impl AsRef<Path>, persist: bool) -> Result<Self> {
        let root_path = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_path)?;
        debug!(target: "echofiles::store", "SharedStore open root='{}' persist={}", root_path.display(), persist);
        let registry = kv::kv_registry_for_root(&root_path, persist);
        Ok(Self { root: Some(root_path), registry })
    }

    /// Purely in-memory store; nothing touches the filesystem.
    pub fn in_memory() -> Self {
        Self { root: None, registry: Arc::new(KvStoresRegistry::new(None, false)) }
    }

    pub fn root_path(&self) -> Option<&Path> { self.root.as_deref() }

    pub fn kv_registry(&self) -> Arc<KvStoresRegistry> { self.registry.clone() }

    pub fn kv_store(&self, database: &str, store_name: &str) -> KvStore {
        self.registry.get_store(database, store_name)
    }

    /// Start the registry's single snapshot task at its configured cadence. `None` when the
    /// registry does not persist.
    pub fn spawn_snapshot_loop(&self) -> Option<tokio::task::JoinHandle<()>> {
        let every = self.registry.persistence()?.interval();
        Some(self.spawn_snapshot_loop_every(every))
    }

    /// One task flushes every open store each `every`, however many stores exist.
    pub fn spawn_snapshot_loop_every(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reg = registry.clone();
                match tokio::task::spawn_blocking(move || reg.save_all()).await {
                    Ok(Ok(n)) => debug!(target: "echofiles::store", stores = n, "kv_snapshot"),
                    Ok(Err(e)) => warn!(target: "echofiles::store", "periodic snapshot failed: {}", e),
                    Err(e) => warn!(target: "echofiles::store", "snapshot task panicked: {}", e),
                }
            }
        })
    }
}
