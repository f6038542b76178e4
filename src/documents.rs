//! Storage for uploaded document images.

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::errors::AppError;
use crate::models::Upload;

/// Largest document image accepted for ID verification.
pub const MAX_DOCUMENT_SIZE: i64 = 4 * 1024 * 1024;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), AppError>;

    async fn load(&self, key: &str) -> Result<Vec<u8>, AppError>;
}

/// Encodes an upload the way the identity provider expects images.
pub fn to_data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!(
        "{};base64,{}",
        content_type,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Loads and encodes one upload.
pub async fn encode_upload(store: &dyn DocumentStore, upload: &Upload) -> Result<String, AppError> {
    let bytes = store.load(&upload.storage_key()).await?;
    Ok(to_data_uri(&upload.content_type, &bytes))
}

/// Files under a root directory, one subdirectory per user.
pub struct LocalDocumentStore {
    root: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AppError> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(AppError::BadRequest(format!("Invalid document key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::InternalError(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            AppError::InternalError(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, AppError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("Document {} not found", key)))
            }
            Err(e) => Err(AppError::InternalError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), AppError> {
        self.files.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, AppError> {
        self.files
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Document {} not found", key)))
    }
}
