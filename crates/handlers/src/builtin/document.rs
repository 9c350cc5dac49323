use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::domain::{FieldDescriptor, FieldType};
use storage::{FileScope, FileStore};

use super::DOCUMENT_IMAGE_RULE;
use crate::attachment::with_download_url;
use crate::{
    store_attachments, AttachmentSlot, ModuleHandler, NormalizedPayload, PersistError,
    RawSubmission, ValidationError,
};

const NOTES: &str = "notes";
const MAX_NOTES_CHARS: usize = 500;

/// A document captured as a front and a back image, plus optional notes.
pub struct TwoSidedDocumentHandler {
    kind: &'static str,
    display_name: &'static str,
    front: AttachmentSlot,
    back: AttachmentSlot,
}

impl TwoSidedDocumentHandler {
    pub const INSURANCE_CARD: &'static str = "insurance_card";
    pub const DRIVERS_LICENSE: &'static str = "drivers_license";

    pub fn insurance_card(max_bytes: usize) -> Self {
        Self::new(
            Self::INSURANCE_CARD,
            "Insurance Card",
            ("front_file", "Front of card"),
            ("back_file", "Back of card"),
            max_bytes,
        )
    }

    pub fn drivers_license(max_bytes: usize) -> Self {
        Self::new(
            Self::DRIVERS_LICENSE,
            "Driver's License",
            ("front_image", "Front of license"),
            ("back_image", "Back of license"),
            max_bytes,
        )
    }

    fn new(
        kind: &'static str,
        display_name: &'static str,
        (front_field, front_label): (&'static str, &'static str),
        (back_field, back_label): (&'static str, &'static str),
        max_bytes: usize,
    ) -> Self {
        let slot = |field, label, suffix| AttachmentSlot {
            field,
            label,
            suffix: Some(suffix),
            rule: DOCUMENT_IMAGE_RULE,
            max_bytes,
        };
        Self {
            kind,
            display_name,
            front: slot(front_field, front_label, "front"),
            back: slot(back_field, back_label, "back"),
        }
    }
}

#[async_trait]
impl ModuleHandler for TwoSidedDocumentHandler {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn display_name(&self) -> &'static str {
        self.display_name
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        vec![
            self.front.descriptor(),
            self.back.descriptor(),
            FieldDescriptor::new(NOTES, FieldType::Textarea, "Notes", false)
                .with_hint(format!("Optional, up to {MAX_NOTES_CHARS} characters")),
        ]
    }

    fn validate(&self, mut input: RawSubmission) -> Result<NormalizedPayload, ValidationError> {
        input.reject_unknown(&[NOTES], &[self.front.field, self.back.field])?;
        let front = self.front.take(&mut input)?;
        let back = self.back.take(&mut input)?;

        let mut data = Map::new();
        if let Some(notes) = input.text(NOTES) {
            if notes.chars().count() > MAX_NOTES_CHARS {
                return Err(ValidationError::new(
                    NOTES,
                    format!("notes are too long (max {MAX_NOTES_CHARS} characters)"),
                ));
            }
            data.insert(NOTES.to_string(), Value::String(notes.to_string()));
        }

        Ok(NormalizedPayload {
            data,
            attachments: vec![front, back],
        })
    }

    async fn persist(
        &self,
        payload: NormalizedPayload,
        scope: &FileScope,
        files: &dyn FileStore,
    ) -> Result<Value, PersistError> {
        let mut data = payload.data;
        for stored in store_attachments(payload.attachments, scope, files).await? {
            data.insert(stored.field.clone(), stored.to_value());
        }
        Ok(Value::Object(data))
    }

    fn present(&self, result_data: &Value) -> Value {
        let mut presented = result_data.clone();
        if let Some(object) = presented.as_object_mut() {
            for field in [self.front.field, self.back.field] {
                if let Some(file) = object.get_mut(field) {
                    *file = with_download_url(file);
                }
            }
        }
        presented
    }
}
