//! HTTP handlers. Each one extracts its input, calls one engine operation and maps
//! the resulting [`ApiError`] onto a status code.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use engine::admin;
use handlers::{RawSubmission, UploadedFile};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Actor, ModuleId, RequestId},
    error::{ApiError, ErrorCode},
    protocol::{
        AccessLogEntry, AddModulePayload, CreateRequestPayload, CreatedRequest,
        ModuleKindSummary, ModuleSummary, ModuleView, RequestPage, RequestProgress, RequestView,
    },
};
use tracing::error;

use crate::app_state::AppState;

pub(crate) type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
pub(crate) struct ViewQuery {
    module: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RemoveModuleQuery {
    #[serde(default)]
    force: bool,
}

/// Everything an operator sees for one request.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RequestOverview {
    pub(crate) request: RequestView,
    pub(crate) progress: RequestProgress,
    pub(crate) ratio: String,
    pub(crate) modules: Vec<ModuleView>,
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Expired => StatusCode::GONE,
        ErrorCode::Validation | ErrorCode::UnknownModuleType => StatusCode::BAD_REQUEST,
        ErrorCode::EditLocked | ErrorCode::Conflict | ErrorCode::CannotRemoveCompleted => {
            StatusCode::CONFLICT
        }
        ErrorCode::Storage => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    if !err.code.is_client_error() {
        error!(code = ?err.code, message = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

pub(crate) fn actor_from(headers: &HeaderMap) -> Actor {
    Actor {
        // First hop is the client when behind proxies.
        ip_address: header_text(headers, "x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        user_agent: header_text(headers, header::USER_AGENT.as_str()).map(str::to_string),
    }
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Collects multipart parts into a submission. File inputs left empty by the
/// browser arrive as a part with no file name and no bytes and are skipped.
async fn read_submission(mut multipart: Multipart) -> ApiResult<RawSubmission> {
    let mut submission = RawSubmission::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                if filename.is_empty() && bytes.is_empty() {
                    continue;
                }
                submission.attachments.insert(
                    name,
                    UploadedFile {
                        filename,
                        content_type,
                        bytes: bytes.to_vec(),
                    },
                );
            }
            None => {
                let value = field.text().await.map_err(multipart_error)?;
                submission.fields.insert(name, value);
            }
        }
    }
    Ok(submission)
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> (StatusCode, Json<ApiError>) {
    (
        err.status(),
        Json(ApiError::new(ErrorCode::Validation, err.body_text())),
    )
}

pub(crate) async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.engine.storage.health_check().await.map_err(|error| {
        error!(%error, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

pub(crate) async fn http_list_kinds(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<ModuleKindSummary>> {
    Json(admin::list_kinds(&state.engine))
}

pub(crate) async fn http_create_request(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRequestPayload>,
) -> ApiResult<(StatusCode, Json<CreatedRequest>)> {
    let created = admin::create_request(&state.engine, payload)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(crate) async fn http_request_overview(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<i64>,
) -> ApiResult<Json<RequestOverview>> {
    let request_id = RequestId(request_id);
    let request = admin::request_details(&state.engine, request_id)
        .await
        .map_err(reject)?;
    let progress = admin::request_progress(&state.engine, request_id)
        .await
        .map_err(reject)?;
    let modules = admin::request_data(&state.engine, request_id)
        .await
        .map_err(reject)?;
    Ok(Json(RequestOverview {
        ratio: progress.ratio(),
        request,
        progress,
        modules,
    }))
}

pub(crate) async fn http_delete_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<i64>,
) -> ApiResult<StatusCode> {
    admin::delete_request(&state.engine, RequestId(request_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn http_add_module(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<i64>,
    Json(payload): Json<AddModulePayload>,
) -> ApiResult<(StatusCode, Json<ModuleSummary>)> {
    let module = admin::add_module(&state.engine, RequestId(request_id), payload)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(module)))
}

pub(crate) async fn http_access_log(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<i64>,
) -> ApiResult<Json<Vec<AccessLogEntry>>> {
    let entries = admin::access_log(&state.engine, RequestId(request_id))
        .await
        .map_err(reject)?;
    Ok(Json(entries))
}

pub(crate) async fn http_module_data(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<i64>,
) -> ApiResult<Json<ModuleView>> {
    let view = admin::module_data(&state.engine, ModuleId(module_id))
        .await
        .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn http_remove_module(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<i64>,
    Query(q): Query<RemoveModuleQuery>,
) -> ApiResult<StatusCode> {
    admin::remove_module(&state.engine, ModuleId(module_id), q.force)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn http_view_request(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(q): Query<ViewQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<RequestPage>> {
    let page = engine::view_request(
        &state.engine,
        &token,
        q.module.map(ModuleId),
        &actor_from(&headers),
    )
    .await
    .map_err(reject)?;
    Ok(Json(page))
}

pub(crate) async fn http_submit_module(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<i64>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<Json<ModuleView>> {
    let submission = read_submission(multipart).await?;
    let view = engine::submit_module(
        &state.engine,
        ModuleId(module_id),
        submission,
        &actor_from(&headers),
    )
    .await
    .map_err(reject)?;
    Ok(Json(view))
}

pub(crate) async fn http_download(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let bytes = engine::download_attachment(&state.engine, &reference)
        .await
        .map_err(reject)?;

    let mut headers = HeaderMap::new();
    let content_type = mime_guess::from_path(&reference).first_or_octet_stream();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type.as_ref())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    let filename = reference.rsplit('/').next().unwrap_or_default();
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((StatusCode::OK, headers, bytes))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
