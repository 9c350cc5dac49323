//! Request/module state machine.
//!
//! Operations are free functions over a cloneable [`EngineContext`]. Each one reads
//! fresh state from the store, does its work and writes back before returning.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use handlers::{
    HandlerRegistry, ModuleHandler, PersistError, RawSubmission, UnknownKind, ValidationError,
};
use serde_json::{json, Value};
use shared::{
    domain::{AccessAction, Actor, ModuleId, RequestState},
    error::{ApiError, ErrorCode},
    protocol::{ModuleSummary, ModuleView, RequestPage, RequestView},
};
use storage::{
    FileScope, FileStore, ModuleSubmission, Storage, StorageError, StoredModule, StoredRef,
    StoredRequest,
};
use tracing::{debug, info, warn};

pub mod admin;
pub mod locks;
mod tracked;

pub use locks::ModuleLocks;
use tracked::TrackedFiles;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Expiry applied when a new request does not ask for one; `0` means never.
    pub default_expiry_days: i64,
    pub max_modules_per_request: usize,
    /// Upper bound on a handler's attachment writes for one submission.
    pub storage_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_expiry_days: 7,
            max_modules_per_request: 20,
            storage_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct EngineContext {
    pub storage: Storage,
    pub files: Arc<dyn FileStore>,
    pub registry: Arc<HandlerRegistry>,
    pub locks: ModuleLocks,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(
        storage: Storage,
        files: Arc<dyn FileStore>,
        registry: Arc<HandlerRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            files,
            registry,
            locks: ModuleLocks::default(),
            config,
        }
    }
}

/// Looks up a request by token and refuses it once expired.
pub async fn resolve(ctx: &EngineContext, token: &str) -> Result<StoredRequest, ApiError> {
    let request = ctx
        .storage
        .request_by_token(token)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("request"))?;
    ensure_not_expired(&request)?;
    Ok(request)
}

pub async fn list_modules(
    ctx: &EngineContext,
    request: &StoredRequest,
) -> Result<Vec<ModuleSummary>, ApiError> {
    let modules = ctx
        .storage
        .list_modules(request.request_id)
        .await
        .map_err(internal)?;
    Ok(modules.iter().map(summarize).collect())
}

/// Picks the module to show: the requested one if it belongs to `request`, else
/// the first incomplete module in presentation order, else the first module.
pub async fn select_module(
    ctx: &EngineContext,
    request: &StoredRequest,
    requested: Option<ModuleId>,
) -> Result<ModuleView, ApiError> {
    let module = match requested {
        Some(module_id) => ctx
            .storage
            .load_module_in_request(request.request_id, module_id)
            .await
            .map_err(internal)?,
        None => {
            let modules = ctx
                .storage
                .list_modules(request.request_id)
                .await
                .map_err(internal)?;
            default_selection(modules)
        }
    };
    let module = module.ok_or_else(|| ApiError::not_found("module"))?;
    present_module(ctx, &module)
}

/// Appends a `view` entry. Requests without a selected module are still logged.
pub async fn record_view(
    ctx: &EngineContext,
    request: &StoredRequest,
    module_id: Option<ModuleId>,
    actor: &Actor,
) -> Result<(), ApiError> {
    ctx.storage
        .record_access(request.request_id, module_id, actor, AccessAction::View)
        .await
        .map_err(internal)?;
    ctx.storage
        .touch_request(request.request_id, Utc::now())
        .await
        .map_err(internal)?;
    debug!(
        request_id = request.request_id.0,
        module_id = module_id.map(|id| id.0),
        "request viewed"
    );
    Ok(())
}

/// The submitter's page: resolves the token, selects a module and logs the view.
pub async fn view_request(
    ctx: &EngineContext,
    token: &str,
    requested: Option<ModuleId>,
    actor: &Actor,
) -> Result<RequestPage, ApiError> {
    let request = resolve(ctx, token).await?;
    let modules = ctx
        .storage
        .list_modules(request.request_id)
        .await
        .map_err(internal)?;

    let selected = if modules.is_empty() && requested.is_none() {
        None
    } else {
        Some(select_module(ctx, &request, requested).await?)
    };

    record_view(
        ctx,
        &request,
        selected.as_ref().map(|view| view.summary.module_id),
        actor,
    )
    .await?;

    Ok(RequestPage {
        request: request_view(&request, &modules),
        selected,
    })
}

/// Validates and stores one submission, then commits completion and the `submit`
/// log entry together.
pub async fn submit_module(
    ctx: &EngineContext,
    module_id: ModuleId,
    input: RawSubmission,
    actor: &Actor,
) -> Result<ModuleView, ApiError> {
    let _guard = ctx.locks.acquire(module_id).await;

    let module = load_module(ctx, module_id).await?;
    let request = ctx
        .storage
        .request_by_id(module.request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("request"))?;
    ensure_not_expired(&request)?;

    let handler = ctx.registry.lookup(&module.kind).map_err(unknown_kind)?;
    if module.completed && !handler.accepts_edits() {
        return Err(ApiError::new(
            ErrorCode::EditLocked,
            format!("{} cannot be changed once submitted", handler.display_name()),
        ));
    }

    let payload = handler.validate(input).map_err(|err| {
        debug!(module_id = module_id.0, field = %err.field, reason = %err.reason, "submission rejected");
        invalid(err)
    })?;

    // Files saved by a submission that never commits are deleted again.
    let scope = FileScope::new(&request.token, &module.kind);
    let files = TrackedFiles::new(ctx.files.as_ref());
    let persisted = tokio::time::timeout(
        ctx.config.storage_timeout,
        handler.persist(payload, &scope, &files),
    )
    .await;
    let result_data = match persisted {
        Ok(Ok(result_data)) => result_data,
        Ok(Err(err)) => {
            files.discard().await;
            return Err(persist_failed(module_id, err));
        }
        Err(_) => {
            files.discard().await;
            return Err(persist_failed(
                module_id,
                PersistError::Storage(StorageError::TimedOut(ctx.config.storage_timeout)),
            ));
        }
    };

    let mut edit_history = module.edit_history.clone();
    if module.completed {
        edit_history.push(json!({
            "version": module.version,
            "completed_at": module.completed_at,
            "result_data": module.result_data,
        }));
    }

    let applied = ctx
        .storage
        .apply_submission(&ModuleSubmission {
            module_id,
            expected_version: module.version,
            result_data: &result_data,
            edit_history: &edit_history,
            submitted_at: Utc::now(),
            actor,
        })
        .await;
    let applied = match applied {
        Ok(applied) => applied,
        Err(err) => {
            files.discard().await;
            return Err(internal(err));
        }
    };
    let Some(applied) = applied else {
        files.discard().await;
        warn!(module_id = module_id.0, "module changed during submission");
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "module was updated by another submission; retry",
        ));
    };

    info!(
        request_id = applied.request_id.0,
        module_id = module_id.0,
        kind = %module.kind,
        edit = module.completed,
        request_completed = applied.request_completed_at.is_some(),
        "module submitted"
    );

    let updated = load_module(ctx, module_id).await?;
    Ok(module_view(handler.as_ref(), &updated))
}

/// Reads a stored attachment. The reference must stay inside the store and belong
/// to a request that still exists and has not expired.
pub async fn download_attachment(
    ctx: &EngineContext,
    reference: &str,
) -> Result<Vec<u8>, ApiError> {
    let reference = StoredRef::parse(reference).map_err(|err| {
        debug!(error = %err, "download reference rejected");
        ApiError::not_found("file")
    })?;
    resolve(ctx, reference.request_token()).await?;

    ctx.files
        .retrieve(&reference)
        .await
        .map_err(|err| match err {
            StorageError::NotFound(_) | StorageError::InvalidReference(_) => {
                ApiError::not_found("file")
            }
            other => storage_failed(other),
        })
}

pub(crate) async fn load_module(
    ctx: &EngineContext,
    module_id: ModuleId,
) -> Result<StoredModule, ApiError> {
    ctx.storage
        .load_module(module_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("module"))
}

pub(crate) fn present_module(
    ctx: &EngineContext,
    module: &StoredModule,
) -> Result<ModuleView, ApiError> {
    let handler = ctx.registry.lookup(&module.kind).map_err(unknown_kind)?;
    Ok(module_view(handler.as_ref(), module))
}

fn module_view(handler: &dyn ModuleHandler, module: &StoredModule) -> ModuleView {
    let data = if module.completed {
        handler.present(&module.result_data)
    } else {
        Value::Null
    };
    ModuleView {
        summary: summarize(module),
        display_name: handler.display_name().to_string(),
        fields: handler.fields(),
        version: module.version,
        data,
    }
}

fn default_selection(modules: Vec<StoredModule>) -> Option<StoredModule> {
    let first_incomplete = modules.iter().position(|module| !module.completed);
    modules
        .into_iter()
        .nth(first_incomplete.unwrap_or(0))
}

pub(crate) fn summarize(module: &StoredModule) -> ModuleSummary {
    ModuleSummary {
        module_id: module.module_id,
        kind: module.kind.clone(),
        label: module.label.clone(),
        description: module.description.clone(),
        sort_order: module.sort_order,
        required: module.required,
        completed: module.completed,
        completed_at: module.completed_at,
    }
}

pub(crate) fn request_view(request: &StoredRequest, modules: &[StoredModule]) -> RequestView {
    RequestView {
        request_id: request.request_id,
        token: request.token.clone(),
        label: request.label.clone(),
        state: request_state(request),
        created_at: request.created_at,
        expires_at: request.expires_at,
        completed_at: request.completed_at,
        metadata: request.metadata.clone(),
        modules: modules.iter().map(summarize).collect(),
    }
}

pub(crate) fn request_state(request: &StoredRequest) -> RequestState {
    RequestState::at(Utc::now(), request.expires_at, request.completed_at)
}

fn ensure_not_expired(request: &StoredRequest) -> Result<(), ApiError> {
    if request_state(request) == RequestState::Expired {
        return Err(ApiError::new(ErrorCode::Expired, "request has expired"));
    }
    Ok(())
}

fn invalid(err: ValidationError) -> ApiError {
    ApiError::validation(err.field, err.reason)
}

pub(crate) fn unknown_kind(err: UnknownKind) -> ApiError {
    warn!(kind = %err.0, "no handler registered for module kind");
    ApiError::new(ErrorCode::UnknownModuleType, err.to_string())
}

fn persist_failed(module_id: ModuleId, err: PersistError) -> ApiError {
    warn!(module_id = module_id.0, error = %err, "failed to store submission");
    match err {
        PersistError::Storage(err) => storage_failed(err),
        PersistError::Crypto(err) => {
            ApiError::new(ErrorCode::Internal, format!("failed to seal submission: {err}"))
        }
    }
}

pub(crate) fn storage_failed(err: StorageError) -> ApiError {
    ApiError::new(ErrorCode::Storage, err.to_string())
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
