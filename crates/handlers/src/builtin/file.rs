use async_trait::async_trait;
use serde_json::Value;
use shared::domain::FieldDescriptor;
use storage::{FileScope, FileStore};

use super::GENERIC_FILE_RULE;
use crate::attachment::with_download_url;
use crate::{
    store_attachments, AttachmentSlot, ModuleHandler, NormalizedPayload, PersistError,
    RawSubmission, ValidationError,
};

/// One arbitrary document upload.
pub struct FileHandler {
    slot: AttachmentSlot,
}

impl FileHandler {
    pub const KIND: &'static str = "file";

    pub fn new(max_bytes: usize) -> Self {
        Self {
            slot: AttachmentSlot {
                field: "file",
                label: "File",
                suffix: None,
                rule: GENERIC_FILE_RULE,
                max_bytes,
            },
        }
    }
}

#[async_trait]
impl ModuleHandler for FileHandler {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn display_name(&self) -> &'static str {
        "File Upload"
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        vec![self.slot.descriptor()]
    }

    fn validate(&self, mut input: RawSubmission) -> Result<NormalizedPayload, ValidationError> {
        input.reject_unknown(&[], &[self.slot.field])?;
        let attachment = self.slot.take(&mut input)?;
        Ok(NormalizedPayload {
            data: Default::default(),
            attachments: vec![attachment],
        })
    }

    async fn persist(
        &self,
        payload: NormalizedPayload,
        scope: &FileScope,
        files: &dyn FileStore,
    ) -> Result<Value, PersistError> {
        let stored = store_attachments(payload.attachments, scope, files).await?;
        Ok(stored
            .first()
            .map(|attachment| attachment.to_value())
            .unwrap_or(Value::Null))
    }

    fn present(&self, result_data: &Value) -> Value {
        with_download_url(result_data)
    }
}
