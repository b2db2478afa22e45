//! Object storage
//!
//! Artifact and trace archives are written through [`ObjectStore`]. The local
//! implementation maps keys to files below a root directory.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::error::ServiceError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => {
                ServiceError::not_found(format!("object '{}' not found", key))
            }
            StorageError::InvalidKey(_) => ServiceError::bad_request(err.to_string()),
            StorageError::Io(_) => {
                tracing::error!("Object storage error: {}", err);
                ServiceError::unavailable("Object storage unavailable")
            }
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    /// Deleting a missing object succeeds
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Objects stored as plain files under `root`
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let normal = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !normal {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        tracing::debug!(key, size = data.len(), "Object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
