//! Content placement for uploaded attachments.
//!
//! Every stored file lives at `{root}/{request_token}/{module_kind}/{file_name}` and is
//! addressed by its root-relative path, a [`StoredRef`]. References never carry the
//! absolute location of the store.

use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage reference '{0}'")]
    InvalidReference(String),
    #[error("stored file not found: {0}")]
    NotFound(String),
    #[error("storage operation timed out after {0:?}")]
    TimedOut(Duration),
    #[error("storage I/O failed for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Root-relative path of a stored file, `token/kind/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoredRef(String);

impl StoredRef {
    /// Parses a caller-supplied reference, rejecting absolute paths, empty segments
    /// and `.`/`..` traversal.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        if raw.is_empty() || raw.starts_with('/') || raw.starts_with('\\') {
            return Err(StorageError::InvalidReference(raw.to_string()));
        }
        let segments: Vec<&str> = raw.split('/').collect();
        if segments.len() != 3 || !segments.iter().all(|segment| is_safe_segment(segment)) {
            return Err(StorageError::InvalidReference(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn request_token(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for StoredRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StoredRef {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StoredRef::parse(&value)
    }
}

impl From<StoredRef> for String {
    fn from(value: StoredRef) -> Self {
        value.0
    }
}

/// The folder a module's attachments are placed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileScope {
    pub request_token: String,
    pub module_kind: String,
}

impl FileScope {
    pub fn new(request_token: impl Into<String>, module_kind: impl Into<String>) -> Self {
        Self {
            request_token: request_token.into(),
            module_kind: module_kind.into(),
        }
    }

    pub fn reference_for(&self, file_name: &str) -> Result<StoredRef, StorageError> {
        StoredRef::parse(&format!(
            "{}/{}/{}",
            self.request_token, self.module_kind, file_name
        ))
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn save(
        &self,
        scope: &FileScope,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<StoredRef, StorageError>;
    async fn retrieve(&self, reference: &StoredRef) -> Result<Vec<u8>, StorageError>;
    /// Removing a file that is already gone is not an error.
    async fn delete(&self, reference: &StoredRef) -> Result<(), StorageError>;
    /// Removes everything stored for one request.
    async fn delete_request_scope(&self, request_token: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create upload root '{}'", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, reference: &StoredRef) -> PathBuf {
        reference
            .as_str()
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(
        &self,
        scope: &FileScope,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<StoredRef, StorageError> {
        let reference = scope.reference_for(file_name)?;
        let target = self.absolute(&reference);
        let Some(dir) = target.parent() else {
            return Err(StorageError::InvalidReference(reference.to_string()));
        };
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io(dir, e))?;

        // Write beside the target and rename so readers never see a partial file.
        let partial = dir.join(format!(".{file_name}.partial"));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .await
            .map_err(|e| StorageError::io(&partial, e))?;
        let written = async {
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(source) = written {
            let _ = fs::remove_file(&partial).await;
            return Err(StorageError::io(&partial, source));
        }
        fs::rename(&partial, &target)
            .await
            .map_err(|e| StorageError::io(&target, e))?;

        debug!(reference = %reference, size = bytes.len(), "attachment stored");
        Ok(reference)
    }

    async fn retrieve(&self, reference: &StoredRef) -> Result<Vec<u8>, StorageError> {
        let path = self.absolute(reference);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    /// Also drops a `.partial` sibling left by a save that never reached its rename.
    async fn delete(&self, reference: &StoredRef) -> Result<(), StorageError> {
        let path = self.absolute(reference);
        remove_if_present(&path).await?;
        if let (Some(dir), Some(name)) = (path.parent(), path.file_name()) {
            let partial = dir.join(format!(".{}.partial", name.to_string_lossy()));
            remove_if_present(&partial).await?;
        }
        Ok(())
    }

    async fn delete_request_scope(&self, request_token: &str) -> Result<(), StorageError> {
        if !is_safe_segment(request_token) {
            return Err(StorageError::InvalidReference(request_token.to_string()));
        }
        let path = self.root.join(request_token);
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.starts_with('.')
        && !segment
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control())
}

#[cfg(test)]
#[path = "tests/files_tests.rs"]
mod tests;
