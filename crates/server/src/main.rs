use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use engine::EngineContext;
use handlers::HandlerRegistry;
use storage::{LocalFileStore, Storage};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use api::{
    healthz, http_access_log, http_add_module, http_create_request, http_delete_request,
    http_download, http_list_kinds, http_module_data, http_remove_module, http_request_overview,
    http_submit_module, http_view_request,
};
use app_state::AppState;
use config::{load_settings, prepare_database_url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let handler_settings = settings.handler_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let files = LocalFileStore::new(&settings.upload_root)?;
    let registry = HandlerRegistry::builtin(&handler_settings);
    info!(kinds = registry.len(), upload_root = %settings.upload_root, "module handlers ready");

    let engine = EngineContext::new(
        storage,
        Arc::new(files),
        Arc::new(registry),
        settings.engine_config(),
    );
    let app = build_router(Arc::new(AppState { engine }), settings.body_limit());

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/modules", get(http_list_kinds))
        .route("/admin/requests", post(http_create_request))
        .route(
            "/admin/requests/:request_id",
            get(http_request_overview).delete(http_delete_request),
        )
        .route("/admin/requests/:request_id/modules", post(http_add_module))
        .route("/admin/requests/:request_id/access_log", get(http_access_log))
        .route(
            "/admin/modules/:module_id",
            get(http_module_data).delete(http_remove_module),
        )
        .route("/r/:token", get(http_view_request))
        .route("/modules/:module_id/submit", post(http_submit_module))
        .route("/files/*reference", get(http_download))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
