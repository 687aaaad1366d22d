// Bundle artifact storage.
//
// The codec talks to the blob store through this contract: three named
// octet streams per model bundle. Production uses the directory-backed
// store; tests use the in-memory one.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::StoreError;

pub const TOPOLOGY_ARTIFACT: &str = "model/topology";
pub const WEIGHTS_ARTIFACT: &str = "model/weights";
pub const METADATA_ARTIFACT: &str = "model/metadata";

pub trait BundleStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Vec<u8>, StoreError>;
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// Directory-backed store. Artifact names map to paths under the root;
/// parent directories are created on write.
pub struct FsBundleStore {
    root: PathBuf,
}

impl FsBundleStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn artifact_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl BundleStore for FsBundleStore {
    fn get(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        fs::read(self.artifact_path(name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
            _ => StoreError::Io {
                name: name.to_string(),
                source: e,
            },
        })
    }

    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.artifact_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                name: name.to_string(),
                source: e,
            })?;
        }
        fs::write(&path, bytes).map_err(|e| StoreError::Io {
            name: name.to_string(),
            source: e,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Mutex-guarded map of artifact bytes. Test double for the blob store.
pub struct MemBundleStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemBundleStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemBundleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleStore for MemBundleStore {
    fn get(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
