//! Operator-side request assembly and inspection.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use shared::{
    domain::{ModuleId, RequestId},
    error::{ApiError, ErrorCode},
    protocol::{
        AccessLogEntry, AddModulePayload, CreateRequestPayload, CreatedRequest,
        ModuleKindSummary, ModuleSummary, ModuleView, RequestProgress, RequestView,
    },
};
use storage::{ModuleAddition, ModuleRemoval, NewModule, NewRequest, StoredRequest};
use tracing::{info, warn};

use crate::{
    internal, load_module, present_module, request_state, request_view, summarize,
    unknown_kind, EngineContext,
};

const TOKEN_BYTES: usize = 32;

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub async fn create_request(
    ctx: &EngineContext,
    payload: CreateRequestPayload,
) -> Result<CreatedRequest, ApiError> {
    let days = payload
        .expires_in_days
        .unwrap_or(ctx.config.default_expiry_days);
    if days < 0 {
        return Err(ApiError::validation(
            "expires_in_days",
            "expiry must not be negative",
        ));
    }
    let expires_at = if days > 0 {
        let expires_at = Duration::try_days(days)
            .and_then(|span| Utc::now().checked_add_signed(span))
            .ok_or_else(|| {
                ApiError::validation("expires_in_days", "expiry is too far in the future")
            })?;
        Some(expires_at)
    } else {
        None
    };

    let request = ctx
        .storage
        .create_request(&NewRequest {
            token: generate_token(),
            label: payload.label,
            metadata: payload.metadata,
            expires_at,
        })
        .await
        .map_err(internal)?;
    info!(request_id = request.request_id.0, expires_at = ?request.expires_at, "request created");

    Ok(CreatedRequest {
        request_id: request.request_id,
        token: request.token,
        expires_at: request.expires_at,
    })
}

pub async fn add_module(
    ctx: &EngineContext,
    request_id: RequestId,
    payload: AddModulePayload,
) -> Result<ModuleSummary, ApiError> {
    load_request(ctx, request_id).await?;
    ctx.registry.lookup(&payload.kind).map_err(unknown_kind)?;

    let sort_order = match payload.sort_order {
        Some(sort_order) => sort_order,
        None => ctx
            .storage
            .next_sort_order(request_id)
            .await
            .map_err(internal)?,
    };
    let limit = ctx.config.max_modules_per_request;
    let addition = ctx
        .storage
        .add_module(
            request_id,
            &NewModule {
                kind: payload.kind,
                label: payload.label,
                description: payload.description,
                sort_order,
                required: payload.required,
            },
            limit,
        )
        .await
        .map_err(internal)?;
    let ModuleAddition::Added(module) = addition else {
        return Err(ApiError::validation(
            "kind",
            format!("a request holds at most {limit} modules"),
        ));
    };
    info!(
        request_id = request_id.0,
        module_id = module.module_id.0,
        kind = %module.kind,
        "module added"
    );
    Ok(summarize(&module))
}

/// Removes a module. Completed modules are kept unless `force` is set.
pub async fn remove_module(
    ctx: &EngineContext,
    module_id: ModuleId,
    force: bool,
) -> Result<(), ApiError> {
    let _guard = ctx.locks.acquire(module_id).await;
    match ctx
        .storage
        .remove_module(module_id, force)
        .await
        .map_err(internal)?
    {
        ModuleRemoval::Removed => {
            info!(module_id = module_id.0, force, "module removed");
            Ok(())
        }
        ModuleRemoval::NotFound => Err(ApiError::not_found("module")),
        ModuleRemoval::Completed => Err(ApiError::new(
            ErrorCode::CannotRemoveCompleted,
            "module is already completed; pass force to remove it",
        )),
    }
}

/// Deletes a request with its modules, access log and stored files.
pub async fn delete_request(ctx: &EngineContext, request_id: RequestId) -> Result<(), ApiError> {
    let request = load_request(ctx, request_id).await?;
    if !ctx
        .storage
        .delete_request(request_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found("request"));
    }
    if let Err(err) = ctx.files.delete_request_scope(&request.token).await {
        warn!(request_id = request_id.0, error = %err, "failed to remove request files");
    }
    info!(request_id = request_id.0, "request deleted");
    Ok(())
}

pub async fn request_details(
    ctx: &EngineContext,
    request_id: RequestId,
) -> Result<RequestView, ApiError> {
    let request = load_request(ctx, request_id).await?;
    let modules = ctx
        .storage
        .list_modules(request_id)
        .await
        .map_err(internal)?;
    Ok(request_view(&request, &modules))
}

pub async fn request_progress(
    ctx: &EngineContext,
    request_id: RequestId,
) -> Result<RequestProgress, ApiError> {
    let request = load_request(ctx, request_id).await?;
    let modules = ctx
        .storage
        .list_modules(request_id)
        .await
        .map_err(internal)?;

    let mut modules_by_kind = BTreeMap::new();
    for module in &modules {
        *modules_by_kind.entry(module.kind.clone()).or_insert(0) += 1;
    }
    Ok(RequestProgress {
        request_id,
        token: request.token.clone(),
        label: request.label.clone(),
        state: request_state(&request),
        completed_modules: modules.iter().filter(|m| m.completed).count(),
        total_modules: modules.len(),
        required_remaining: modules
            .iter()
            .filter(|m| m.required && !m.completed)
            .count(),
        modules_by_kind,
    })
}

/// A module's result data as presented by its handler.
pub async fn module_data(ctx: &EngineContext, module_id: ModuleId) -> Result<ModuleView, ApiError> {
    let module = load_module(ctx, module_id).await?;
    present_module(ctx, &module)
}

/// Presented data for every module of a request, in presentation order.
pub async fn request_data(
    ctx: &EngineContext,
    request_id: RequestId,
) -> Result<Vec<ModuleView>, ApiError> {
    load_request(ctx, request_id).await?;
    let modules = ctx
        .storage
        .list_modules(request_id)
        .await
        .map_err(internal)?;
    modules
        .iter()
        .map(|module| present_module(ctx, module))
        .collect()
}

/// Access entries, newest first.
pub async fn access_log(
    ctx: &EngineContext,
    request_id: RequestId,
) -> Result<Vec<AccessLogEntry>, ApiError> {
    load_request(ctx, request_id).await?;
    let entries = ctx
        .storage
        .list_access_logs(request_id)
        .await
        .map_err(internal)?;
    Ok(entries
        .into_iter()
        .map(|entry| AccessLogEntry {
            access_log_id: entry.access_log_id,
            request_id: entry.request_id,
            module_id: entry.module_id,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            action: entry.action,
            timestamp: entry.timestamp,
        })
        .collect())
}

pub fn list_kinds(ctx: &EngineContext) -> Vec<ModuleKindSummary> {
    ctx.registry.kinds()
}

async fn load_request(ctx: &EngineContext, request_id: RequestId) -> Result<StoredRequest, ApiError> {
    ctx.storage
        .request_by_id(request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("request"))
}

#[cfg(test)]
#[path = "tests/admin_tests.rs"]
mod tests;
