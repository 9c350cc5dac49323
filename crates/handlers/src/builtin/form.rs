use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::domain::{FieldDescriptor, FieldType};
use storage::{FileScope, FileStore};

use crate::{ModuleHandler, NormalizedPayload, PersistError, RawSubmission, ValidationError};

const ANSWER: &str = "answer";
const MAX_ANSWER_CHARS: usize = 5000;

/// A single free-text answer.
pub struct FormHandler;

impl FormHandler {
    pub const KIND: &'static str = "form";
}

#[async_trait]
impl ModuleHandler for FormHandler {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn display_name(&self) -> &'static str {
        "Form Question"
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::new(ANSWER, FieldType::Textarea, "Answer", true)
                .with_hint(format!("Up to {MAX_ANSWER_CHARS} characters")),
        ]
    }

    fn validate(&self, input: RawSubmission) -> Result<NormalizedPayload, ValidationError> {
        input.reject_unknown(&[ANSWER], &[])?;
        let answer = input
            .text(ANSWER)
            .ok_or_else(|| ValidationError::new(ANSWER, "answer is required"))?;
        if answer.chars().count() > MAX_ANSWER_CHARS {
            return Err(ValidationError::new(
                ANSWER,
                format!("answer is too long (max {MAX_ANSWER_CHARS} characters)"),
            ));
        }

        let mut data = Map::new();
        data.insert(ANSWER.to_string(), Value::String(answer.to_string()));
        Ok(NormalizedPayload {
            data,
            attachments: Vec::new(),
        })
    }

    async fn persist(
        &self,
        payload: NormalizedPayload,
        _scope: &FileScope,
        _files: &dyn FileStore,
    ) -> Result<Value, PersistError> {
        Ok(Value::Object(payload.data))
    }

    fn present(&self, result_data: &Value) -> Value {
        result_data.clone()
    }
}
