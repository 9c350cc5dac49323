//! Module handlers.
//!
//! Every module kind is served by one [`ModuleHandler`]. The engine never looks inside
//! a module's result data; only the handler for the module's kind validates, stores
//! and presents it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::domain::FieldDescriptor;
use storage::{FileScope, FileStore, StorageError};
use thiserror::Error;

pub mod attachment;
pub mod builtin;
pub mod crypto;
pub mod registry;

pub use attachment::{
    sanitize_filename, store_attachments, AttachmentRule, AttachmentSlot, StoredAttachment,
    ValidatedAttachment,
};
pub use crypto::{CryptoError, SecretKey};
pub use registry::{HandlerFactory, HandlerRegistry, HandlerSettings, UnknownKind, BUILTIN_FACTORIES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Untrusted input for one module submission, as received from the submitter.
#[derive(Debug, Clone, Default)]
pub struct RawSubmission {
    pub fields: BTreeMap<String, String>,
    pub attachments: BTreeMap<String, UploadedFile>,
}

impl RawSubmission {
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_attachment(mut self, name: impl Into<String>, file: UploadedFile) -> Self {
        self.attachments.insert(name.into(), file);
        self
    }

    /// Fails on the first text field or attachment the handler does not declare.
    pub fn reject_unknown(
        &self,
        text_fields: &[&str],
        attachment_fields: &[&str],
    ) -> Result<(), ValidationError> {
        if let Some(name) = self
            .fields
            .keys()
            .find(|name| !text_fields.contains(&name.as_str()))
        {
            return Err(ValidationError::new(name.as_str(), "unexpected field"));
        }
        if let Some(name) = self
            .attachments
            .keys()
            .find(|name| !attachment_fields.contains(&name.as_str()))
        {
            return Err(ValidationError::new(name.as_str(), "unexpected attachment"));
        }
        Ok(())
    }

    /// Trimmed text value; blank input counts as absent.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Validated submission: scalar fields plus attachments still held in memory.
#[derive(Debug, Clone, Default)]
pub struct NormalizedPayload {
    pub data: Map<String, Value>,
    pub attachments: Vec<ValidatedAttachment>,
}

#[async_trait]
pub trait ModuleHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    /// Ordered input fields, for presentation only.
    fn fields(&self) -> Vec<FieldDescriptor>;

    fn validate(&self, input: RawSubmission) -> Result<NormalizedPayload, ValidationError>;

    /// Writes attachments through `files` and returns the canonical result data.
    async fn persist(
        &self,
        payload: NormalizedPayload,
        scope: &FileScope,
        files: &dyn FileStore,
    ) -> Result<Value, PersistError>;

    /// Display-safe projection of stored result data.
    fn present(&self, result_data: &Value) -> Value;

    /// Whether a completed module of this kind may be submitted again.
    fn accepts_edits(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
