//! Storage for denoiser model blobs.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::ModelStoreError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8; 5] = b"ustar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    Gzip,
    Tar,
    Unknown,
}

pub fn detect_format(bytes: &[u8]) -> ModelFormat {
    if bytes.starts_with(&GZIP_MAGIC) {
        ModelFormat::Gzip
    } else if bytes.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &bytes[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
    {
        ModelFormat::Tar
    } else {
        ModelFormat::Unknown
    }
}

fn validate_for_put(bytes: &[u8]) -> Result<(), ModelStoreError> {
    if bytes.is_empty() {
        return Err(ModelStoreError::Empty);
    }
    match detect_format(bytes) {
        ModelFormat::Gzip => tracing::debug!("model blob detected as gzip"),
        ModelFormat::Tar => tracing::debug!("model blob detected as tar"),
        // Stored anyway; `get` decides whether it is usable
        ModelFormat::Unknown => tracing::info!("model blob has unknown format, storing anyway"),
    }
    Ok(())
}

fn validate_for_get(key: &str, bytes: Vec<u8>) -> Result<Arc<[u8]>, ModelStoreError> {
    if bytes.is_empty() || !bytes.starts_with(&GZIP_MAGIC) {
        return Err(ModelStoreError::Corrupted(key.to_string()));
    }
    Ok(bytes.into())
}

/// Binary blob storage keyed by model name.
///
/// `get` only returns blobs that pass the gzip magic-byte check.
pub trait ModelStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Arc<[u8]>, ModelStoreError>;

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ModelStoreError>;

    fn delete(&self, key: &str) -> Result<(), ModelStoreError>;

    /// True when a usable blob is stored under `key`.
    fn contains(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }
}

/// One file per key under a directory.
pub struct FsModelStore {
    root: PathBuf,
}

impl FsModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ModelStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ModelStoreError> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(ModelStoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid model key '{key}'"),
            )));
        }
        Ok(self.root.join(format!("{key}.bin")))
    }
}

impl ModelStore for FsModelStore {
    fn get(&self, key: &str) -> Result<Arc<[u8]>, ModelStoreError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ModelStoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        validate_for_get(key, bytes)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ModelStoreError> {
        validate_for_put(bytes)?;
        let path = self.path_for(key)?;
        // Write then rename so a crash never leaves a truncated model behind
        let tmp = path.with_extension("bin.partial");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        tracing::info!(
            "stored model '{}' ({:.2} MB)",
            key,
            bytes.len() as f64 / (1024.0 * 1024.0)
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ModelStoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, handy for tests and embedded models.
#[derive(Default, Clone)]
pub struct MemoryModelStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for MemoryModelStore {
    fn get(&self, key: &str) -> Result<Arc<[u8]>, ModelStoreError> {
        let bytes = self
            .blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(key).cloned())
            .ok_or_else(|| ModelStoreError::NotFound(key.to_string()))?;
        validate_for_get(key, bytes)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ModelStoreError> {
        validate_for_put(bytes)?;
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(key.to_string(), bytes.to_vec());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ModelStoreError> {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.remove(key);
        }
        Ok(())
    }
}
