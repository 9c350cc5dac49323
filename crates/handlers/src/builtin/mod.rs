//! Handlers compiled into the binary.

mod document;
mod file;
mod form;
mod ssn;

pub use document::TwoSidedDocumentHandler;
pub use file::FileHandler;
pub use form::FormHandler;
pub use ssn::SsnHandler;

use crate::AttachmentRule;

pub const GENERIC_FILE_RULE: AttachmentRule = AttachmentRule {
    extensions: &["txt", "pdf", "png", "jpg", "jpeg", "gif", "heic"],
    content_types: &["application/pdf", "image/png", "image/jpeg", "text/plain"],
};

pub const DOCUMENT_IMAGE_RULE: AttachmentRule = AttachmentRule {
    extensions: &["png", "jpg", "jpeg", "pdf"],
    content_types: &["image/png", "image/jpeg", "application/pdf"],
};
