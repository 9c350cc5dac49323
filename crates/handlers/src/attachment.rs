//! The single-attachment slot every file-accepting handler is built from.

use serde_json::{json, Value};
use shared::domain::{FieldDescriptor, FieldType};
use storage::{FileScope, FileStore, StorageError, StoredRef};
use tracing::warn;
use uuid::Uuid;

use crate::{RawSubmission, ValidationError};

const MAX_FILENAME_CHARS: usize = 100;
const FALLBACK_FILENAME: &str = "upload";

/// Route prefix under which stored references are downloadable.
pub const DOWNLOAD_PREFIX: &str = "/files/";

/// Allow-lists an upload must satisfy. The extension and the declared content type
/// must each be allowed and must describe the same format.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentRule {
    pub extensions: &'static [&'static str],
    pub content_types: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct AttachmentSlot {
    pub field: &'static str,
    pub label: &'static str,
    /// Marker placed between the unique prefix and the original name, e.g. `front`.
    pub suffix: Option<&'static str>,
    pub rule: AttachmentRule,
    pub max_bytes: usize,
}

impl AttachmentSlot {
    pub fn descriptor(&self) -> FieldDescriptor {
        FieldDescriptor::new(self.field, FieldType::File, self.label, true)
            .with_hint(format!("Allowed: {}", self.rule.extensions.join(", ")))
    }

    /// Removes this slot's upload from `input` and checks it against the rule.
    pub fn take(&self, input: &mut RawSubmission) -> Result<ValidatedAttachment, ValidationError> {
        let file = input
            .attachments
            .remove(self.field)
            .ok_or_else(|| self.reject("no file provided"))?;
        if file.filename.trim().is_empty() {
            return Err(self.reject("no file selected"));
        }
        if file.bytes.is_empty() {
            return Err(self.reject("file is empty"));
        }
        if file.bytes.len() > self.max_bytes {
            return Err(self.reject(format!(
                "file exceeds the {} byte limit",
                self.max_bytes
            )));
        }

        let extension = extension_of(&file.filename)
            .ok_or_else(|| self.reject("file has no extension"))?;
        if !self.rule.extensions.contains(&extension.as_str()) {
            return Err(self.reject(format!(
                "file type .{extension} is not allowed; supported: {}",
                self.rule.extensions.join(", ")
            )));
        }
        let content_type = normalize_content_type(&file.content_type);
        if !self.rule.content_types.contains(&content_type.as_str()) {
            return Err(self.reject(format!(
                "content type '{content_type}' is not allowed"
            )));
        }
        let agrees = mime_guess::from_ext(&extension)
            .iter()
            .any(|mime| mime.essence_str() == content_type);
        if !agrees {
            return Err(self.reject(format!(
                ".{extension} does not match content type '{content_type}'"
            )));
        }

        Ok(ValidatedAttachment {
            field: self.field.to_string(),
            suffix: self.suffix,
            original_filename: file.filename,
            content_type,
            bytes: file.bytes,
        })
    }

    fn reject(&self, reason: impl Into<String>) -> ValidationError {
        ValidationError::new(self.field, reason)
    }
}

/// An upload that passed its slot's rule and is ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAttachment {
    pub field: String,
    pub suffix: Option<&'static str>,
    pub original_filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ValidatedAttachment {
    /// `{unique}_{suffix}_{sanitized}`, or `{unique}_{sanitized}` without a suffix.
    pub fn stored_name(&self) -> String {
        let unique = Uuid::new_v4().simple();
        let sanitized = sanitize_filename(&self.original_filename);
        match self.suffix {
            Some(suffix) => format!("{unique}_{suffix}_{sanitized}"),
            None => format!("{unique}_{sanitized}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub field: String,
    pub reference: StoredRef,
    pub original_filename: String,
    pub file_size: usize,
    pub content_type: String,
}

impl StoredAttachment {
    pub fn to_value(&self) -> Value {
        json!({
            "file_path": self.reference.as_str(),
            "original_filename": self.original_filename,
            "file_size": self.file_size,
            "mimetype": self.content_type,
        })
    }
}

/// Writes every attachment under `scope`. If one write fails, the ones already
/// written are deleted before the error is returned.
pub async fn store_attachments(
    attachments: Vec<ValidatedAttachment>,
    scope: &FileScope,
    files: &dyn FileStore,
) -> Result<Vec<StoredAttachment>, StorageError> {
    let mut stored: Vec<StoredAttachment> = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        match files
            .save(scope, &attachment.stored_name(), &attachment.bytes)
            .await
        {
            Ok(reference) => stored.push(StoredAttachment {
                field: attachment.field,
                reference,
                original_filename: attachment.original_filename,
                file_size: attachment.bytes.len(),
                content_type: attachment.content_type,
            }),
            Err(err) => {
                discard(&stored, files).await;
                return Err(err);
            }
        }
    }
    Ok(stored)
}

async fn discard(stored: &[StoredAttachment], files: &dyn FileStore) {
    for attachment in stored {
        if let Err(err) = files.delete(&attachment.reference).await {
            warn!(
                reference = %attachment.reference,
                error = %err,
                "failed to remove attachment from an aborted submission"
            );
        }
    }
}

/// Adds a `download_url` to a stored file object; anything else is returned as is.
pub fn with_download_url(file: &Value) -> Value {
    let mut presented = file.clone();
    if let Some(object) = presented.as_object_mut() {
        if let Some(path) = object.get("file_path").and_then(Value::as_str) {
            let url = format!("{DOWNLOAD_PREFIX}{path}");
            object.insert("download_url".to_string(), Value::String(url));
        }
    }
    presented
}

/// Reduces an uploaded file name to ASCII alphanumerics, `.`, `-` and `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut cleaned = cleaned.replace("..", "");

    if cleaned.len() > MAX_FILENAME_CHARS {
        // Keep a short extension intact when cutting the stem.
        cleaned = match cleaned.rsplit_once('.') {
            Some((stem, ext)) if !ext.is_empty() && ext.len() < MAX_FILENAME_CHARS / 2 => {
                format!("{}.{ext}", &stem[..MAX_FILENAME_CHARS - ext.len() - 1])
            }
            _ => cleaned[..MAX_FILENAME_CHARS].to_string(),
        };
    }

    if cleaned.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        cleaned
    }
}

fn extension_of(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.trim().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
#[path = "tests/attachment_tests.rs"]
mod tests;
