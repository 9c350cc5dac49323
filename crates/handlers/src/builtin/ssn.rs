use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use shared::domain::{FieldDescriptor, FieldType};
use storage::{FileScope, FileStore};

use crate::{
    ModuleHandler, NormalizedPayload, PersistError, RawSubmission, SecretKey, ValidationError,
};

const SSN: &str = "ssn";

static SSN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{3}-[0-9]{2}-[0-9]{4}$").expect("ssn pattern compiles"));

/// Social security number, stored sealed with the process-wide key.
///
/// Result data holds `ssn_encrypted` and the last four digits; the plaintext is
/// never returned through [`ModuleHandler::present`].
pub struct SsnHandler {
    key: SecretKey,
}

impl SsnHandler {
    pub const KIND: &'static str = "ssn";

    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl ModuleHandler for SsnHandler {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn display_name(&self) -> &'static str {
        "Social Security Number"
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::new(SSN, FieldType::Text, "Social Security Number", true)
                .with_hint("Format: 123-45-6789"),
        ]
    }

    fn validate(&self, input: RawSubmission) -> Result<NormalizedPayload, ValidationError> {
        input.reject_unknown(&[SSN], &[])?;
        let ssn = input
            .text(SSN)
            .ok_or_else(|| ValidationError::new(SSN, "SSN is required"))?;
        if !SSN_PATTERN.is_match(ssn) {
            return Err(ValidationError::new(
                SSN,
                "SSN must use the format 123-45-6789",
            ));
        }

        let mut data = Map::new();
        data.insert(SSN.to_string(), Value::String(ssn.to_string()));
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
        let ssn = payload
            .data
            .get(SSN)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let last4: String = ssn.chars().skip(ssn.len().saturating_sub(4)).collect();
        Ok(json!({
            "ssn_encrypted": self.key.seal(ssn)?,
            "last4": last4,
        }))
    }

    fn present(&self, result_data: &Value) -> Value {
        let last4 = result_data
            .get("last4")
            .and_then(Value::as_str)
            .unwrap_or("****");
        json!({ "ssn": format!("***-**-{last4}") })
    }
}
