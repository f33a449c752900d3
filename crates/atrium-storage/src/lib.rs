//! Per-workspace keyed metadata directories backed by a persisted UUID index.
//!
//! Each distinct workspace root path is assigned a UUID exactly once and the
//! assignment is persisted in `workspace-metadata/index.json` under the config
//! directory. A store for key `K` lives at
//! `workspace-metadata/{uuid}/{mangled K}/`; its directory is created lazily.
//! Writes to the index are rare (one per newly seen workspace), so concurrent
//! processes get last-writer-wins semantics with no locking.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod fs;

pub use fs::{StorageFs, TokioFs};

const METADATA_DIR: &str = "workspace-metadata";
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Error)]
pub enum StorageError {
    /// Raised at the call boundary when no workspace root has been set.
    #[error("no workspace is currently open")]
    NoWorkspace,
    #[error("metadata i/o failed")]
    Io(#[from] io::Error),
    #[error("metadata index encoding failed")]
    Encode(#[from] serde_json::Error),
}

/// Replaces every character outside `[A-Za-z0-9_-]` with `-`, making the key
/// safe as a path segment. Idempotent.
pub fn mangle_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

type StoreRegistry = Mutex<HashMap<String, Arc<MetadataStore>>>;

/// Allocates per-workspace metadata stores and owns the path→UUID index.
pub struct StorageService {
    fs: Arc<dyn StorageFs>,
    metadata_root: PathBuf,
    workspace_root: std::sync::Mutex<Option<PathBuf>>,
    // Held across UUID resolution so two racing get_or_create calls cannot
    // assign two UUIDs to the same path within this process.
    stores: Arc<StoreRegistry>,
}

impl StorageService {
    pub fn new(fs: Arc<dyn StorageFs>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            metadata_root: config_dir.into().join(METADATA_DIR),
            workspace_root: std::sync::Mutex::new(None),
            stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn workspace_root(&self) -> Option<PathBuf> {
        self.workspace_root.lock().expect("workspace root lock").clone()
    }

    /// Updates the workspace root. Live stores re-resolve their location
    /// against the new root (reusing or creating a UUID for it) and emit a
    /// location change; reacting to the move is the consumer's business.
    pub async fn set_workspace_root(&self, root: Option<PathBuf>) -> Result<(), StorageError> {
        let changed = {
            let mut current = self.workspace_root.lock().expect("workspace root lock");
            if *current == root {
                false
            } else {
                *current = root.clone();
                true
            }
        };
        if !changed {
            return Ok(());
        }
        let Some(root) = root else {
            return Ok(());
        };

        let stores = self.stores.lock().await;
        if stores.is_empty() {
            return Ok(());
        }
        let uuid = self.workspace_uuid(&root).await?;
        for store in stores.values() {
            let location = self.metadata_root.join(&uuid).join(&store.key);
            store.relocate(location);
        }
        Ok(())
    }

    /// Returns the live store for `key`, creating it if absent. Idempotent per
    /// mangled key until the store is disposed.
    pub async fn get_or_create_store(&self, key: &str) -> Result<Arc<MetadataStore>, StorageError> {
        let mangled = mangle_key(key);
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&mangled) {
            return Ok(store.clone());
        }

        let root = self.workspace_root().ok_or(StorageError::NoWorkspace)?;
        let uuid = self.workspace_uuid(&root).await?;
        let location = self.metadata_root.join(&uuid).join(&mangled);
        debug!(key = %mangled, location = %location.display(), "creating metadata store");

        let store = Arc::new(MetadataStore {
            key: mangled.clone(),
            fs: self.fs.clone(),
            location: watch::channel(location).0,
            disposed: AtomicBool::new(false),
            registry: Arc::downgrade(&self.stores),
        });
        stores.insert(mangled, store.clone());
        Ok(store)
    }

    /// UUID for `root`, assigning and persisting a fresh one on first sight.
    /// A previously persisted UUID is never regenerated.
    async fn workspace_uuid(&self, root: &Path) -> Result<String, StorageError> {
        let mut index = self.load_index().await;
        let path_key = root.to_string_lossy().into_owned();
        if let Some(uuid) = index.get(&path_key) {
            return Ok(uuid.clone());
        }

        let uuid = Uuid::new_v4().to_string();
        index.insert(path_key, uuid.clone());
        self.fs.create_dir_all(&self.metadata_root).await?;
        let json = serde_json::to_vec_pretty(&index)?;
        self.fs.write_file(&self.index_path(), &json).await?;
        Ok(uuid)
    }

    /// An unreadable or corrupt index degrades to an empty one: store
    /// creation keeps working and fresh UUIDs get assigned.
    async fn load_index(&self) -> HashMap<String, String> {
        let path = self.index_path();
        let bytes = match self.fs.read_file(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return HashMap::new(),
            Err(error) => {
                warn!(%error, path = %path.display(), "metadata index unreadable, treating as empty");
                return HashMap::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(index) => index,
            Err(error) => {
                warn!(%error, path = %path.display(), "metadata index corrupt, treating as empty");
                HashMap::new()
            }
        }
    }

    fn index_path(&self) -> PathBuf {
        self.metadata_root.join(INDEX_FILE)
    }
}

/// One keyed per-workspace directory. Obtained from
/// [`StorageService::get_or_create_store`]; the directory itself is created
/// only by [`ensure_exists`](MetadataStore::ensure_exists).
pub struct MetadataStore {
    key: String,
    fs: Arc<dyn StorageFs>,
    location: watch::Sender<PathBuf>,
    disposed: AtomicBool,
    registry: Weak<StoreRegistry>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("key", &self.key)
            .field("location", &*self.location.borrow())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// The mangled key this store was created under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn location(&self) -> PathBuf {
        self.location.borrow().clone()
    }

    /// Observes workspace-root-driven relocations. The receiver starts with
    /// the current location already marked seen.
    pub fn location_changed(&self) -> watch::Receiver<PathBuf> {
        self.location.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub async fn ensure_exists(&self) -> Result<(), StorageError> {
        self.fs.create_dir_all(&self.location()).await?;
        Ok(())
    }

    /// Removes the store directory and everything under it. Deleting a store
    /// that was never materialized is not an error.
    pub async fn delete(&self) -> Result<(), StorageError> {
        let location = self.location();
        if self.fs.exists(&location).await {
            self.fs.delete(&location, true).await?;
        }
        Ok(())
    }

    /// Detaches this instance from the service registry; the next
    /// `get_or_create_store` for the same key builds a fresh instance. The
    /// on-disk index and directory are untouched.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            let mut stores = registry.lock().await;
            // Unregister only this instance: a stale handle disposed a second
            // time must not evict the replacement created in between.
            let is_this = stores
                .get(&self.key)
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
            if is_this {
                stores.remove(&self.key);
            }
        }
    }

    fn relocate(&self, location: PathBuf) {
        let previous = self.location.send_replace(location.clone());
        if previous != location {
            debug!(key = %self.key, location = %location.display(), "store relocated");
        }
    }
}
