//! File store wrapper that remembers what one submission wrote.

use async_trait::async_trait;
use storage::{FileScope, FileStore, StorageError, StoredRef};
use tokio::sync::Mutex;
use tracing::warn;

pub(crate) struct TrackedFiles<'a> {
    inner: &'a dyn FileStore,
    attempted: Mutex<Vec<StoredRef>>,
}

impl<'a> TrackedFiles<'a> {
    pub(crate) fn new(inner: &'a dyn FileStore) -> Self {
        Self {
            inner,
            attempted: Mutex::new(Vec::new()),
        }
    }

    /// Removes every file a save was started for, finished or not. Failures are
    /// logged and skipped.
    pub(crate) async fn discard(&self) {
        let attempted = std::mem::take(&mut *self.attempted.lock().await);
        for reference in attempted {
            if let Err(err) = self.inner.delete(&reference).await {
                warn!(reference = %reference, error = %err, "failed to remove abandoned attachment");
            }
        }
    }
}

#[async_trait]
impl FileStore for TrackedFiles<'_> {
    async fn save(
        &self,
        scope: &FileScope,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<StoredRef, StorageError> {
        // Recorded before the write so a save cut off by a timeout is still known.
        if let Ok(reference) = scope.reference_for(file_name) {
            self.attempted.lock().await.push(reference);
        }
        self.inner.save(scope, file_name, bytes).await
    }

    async fn retrieve(&self, reference: &StoredRef) -> Result<Vec<u8>, StorageError> {
        self.inner.retrieve(reference).await
    }

    async fn delete(&self, reference: &StoredRef) -> Result<(), StorageError> {
        self.inner.delete(reference).await
    }

    async fn delete_request_scope(&self, request_token: &str) -> Result<(), StorageError> {
        self.inner.delete_request_scope(request_token).await
    }
}
