//! Keyed set of module handlers.
//!
//! Built-in handlers are listed in [`BUILTIN_FACTORIES`]; [`HandlerRegistry::discover`]
//! rebuilds the registry from that list. After startup the registry is only read and
//! is shared behind an `Arc`.

use std::{collections::BTreeMap, sync::Arc};

use shared::protocol::ModuleKindSummary;
use thiserror::Error;
use tracing::{debug, info};

use crate::builtin::{FileHandler, FormHandler, SsnHandler, TwoSidedDocumentHandler};
use crate::{ModuleHandler, SecretKey};

/// Everything a built-in handler needs at construction time.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub encryption_key: SecretKey,
    pub max_upload_bytes: usize,
}

pub type HandlerFactory = fn(&HandlerSettings) -> Arc<dyn ModuleHandler>;

pub const BUILTIN_FACTORIES: &[HandlerFactory] = &[
    file_handler,
    form_handler,
    insurance_card_handler,
    drivers_license_handler,
    ssn_handler,
];

fn file_handler(settings: &HandlerSettings) -> Arc<dyn ModuleHandler> {
    Arc::new(FileHandler::new(settings.max_upload_bytes))
}

fn form_handler(_: &HandlerSettings) -> Arc<dyn ModuleHandler> {
    Arc::new(FormHandler)
}

fn insurance_card_handler(settings: &HandlerSettings) -> Arc<dyn ModuleHandler> {
    Arc::new(TwoSidedDocumentHandler::insurance_card(
        settings.max_upload_bytes,
    ))
}

fn drivers_license_handler(settings: &HandlerSettings) -> Arc<dyn ModuleHandler> {
    Arc::new(TwoSidedDocumentHandler::drivers_license(
        settings.max_upload_bytes,
    ))
}

fn ssn_handler(settings: &HandlerSettings) -> Arc<dyn ModuleHandler> {
    Arc::new(SsnHandler::new(settings.encryption_key.clone()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown module type '{0}'")]
pub struct UnknownKind(pub String);

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ModuleHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in handler.
    pub fn builtin(settings: &HandlerSettings) -> Self {
        let mut registry = Self::new();
        registry.discover(settings);
        registry
    }

    /// Registers `handler` under `kind`, replacing and returning any previous one.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn ModuleHandler>,
    ) -> Option<Arc<dyn ModuleHandler>> {
        let kind = kind.into();
        debug!(kind = %kind, "module handler registered");
        self.handlers.insert(kind, handler)
    }

    pub fn lookup(&self, kind: &str) -> Result<Arc<dyn ModuleHandler>, UnknownKind> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Clears the registry and rebuilds it from [`BUILTIN_FACTORIES`]. Returns the
    /// number of registered handlers.
    pub fn discover(&mut self, settings: &HandlerSettings) -> usize {
        self.handlers.clear();
        for factory in BUILTIN_FACTORIES {
            let handler = factory(settings);
            self.register(handler.kind(), handler);
        }
        info!(handler_count = self.handlers.len(), "module handlers discovered");
        self.handlers.len()
    }

    /// Registered kinds in name order, with their display names.
    pub fn kinds(&self) -> Vec<ModuleKindSummary> {
        self.handlers
            .iter()
            .map(|(kind, handler)| ModuleKindSummary {
                kind: kind.clone(),
                display_name: handler.display_name().to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
