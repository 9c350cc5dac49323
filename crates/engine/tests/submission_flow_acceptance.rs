use std::sync::Arc;

use engine::{
    admin, download_attachment, resolve, submit_module, view_request, EngineConfig, EngineContext,
};
use handlers::{HandlerRegistry, HandlerSettings, RawSubmission, SecretKey, UploadedFile};
use serde_json::Map;
use shared::{
    domain::{AccessAction, Actor, ModuleId, RequestState},
    error::ErrorCode,
    protocol::{AddModulePayload, CreateRequestPayload, CreatedRequest},
};
use storage::{LocalFileStore, Storage};

async fn engine(database_url: &str, dir: &tempfile::TempDir) -> EngineContext {
    let storage = Storage::new(database_url).await.expect("db");
    let files = LocalFileStore::new(dir.path().join("uploads")).expect("files");
    let registry = HandlerRegistry::builtin(&HandlerSettings {
        encryption_key: SecretKey::generate(),
        max_upload_bytes: 10 * 1024 * 1024,
    });
    EngineContext::new(
        storage,
        Arc::new(files),
        Arc::new(registry),
        EngineConfig::default(),
    )
}

fn database_url(dir: &tempfile::TempDir) -> String {
    let db_path = dir.path().join("filemaster.db");
    format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"))
}

async fn file_backed_engine(dir: &tempfile::TempDir) -> EngineContext {
    engine(&database_url(dir), dir).await
}

async fn request_with(ctx: &EngineContext, kinds: &[&str]) -> (CreatedRequest, Vec<ModuleId>) {
    let created = admin::create_request(
        ctx,
        CreateRequestPayload {
            label: Some("Test Customer - 2025 Camry".into()),
            expires_in_days: Some(7),
            metadata: Map::new(),
        },
    )
    .await
    .expect("request");
    let mut ids = Vec::new();
    for kind in kinds {
        let module = admin::add_module(
            ctx,
            created.request_id,
            AddModulePayload {
                kind: kind.to_string(),
                label: None,
                description: None,
                sort_order: None,
                required: true,
            },
        )
        .await
        .expect("module");
        ids.push(module.module_id);
    }
    (created, ids)
}

fn upload(filename: &str, content_type: &str, bytes: &[u8]) -> UploadedFile {
    UploadedFile {
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        bytes: bytes.to_vec(),
    }
}

fn submitter() -> Actor {
    Actor {
        ip_address: Some("203.0.113.9".into()),
        user_agent: Some("Mozilla/5.0".into()),
    }
}

async fn state_of(ctx: &EngineContext, token: &str) -> RequestState {
    view_request(ctx, token, None, &Actor::default())
        .await
        .expect("view")
        .request
        .state
}

#[tokio::test]
async fn form_then_file_completes_request_with_two_submissions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = engine("sqlite::memory:", &dir).await;
    let (created, ids) = request_with(&ctx, &["form", "file"]).await;

    let form = submit_module(
        &ctx,
        ids[0],
        RawSubmission::default().with_field("answer", "42"),
        &submitter(),
    )
    .await
    .expect("form");
    assert!(form.summary.completed);
    assert_eq!(state_of(&ctx, &created.token).await, RequestState::Active);

    let err = submit_module(
        &ctx,
        ids[1],
        RawSubmission::default().with_attachment("file", upload("setup.exe", "application/pdf", b"MZ")),
        &submitter(),
    )
    .await
    .expect_err("exe rejected");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(state_of(&ctx, &created.token).await, RequestState::Active);

    let file = submit_module(
        &ctx,
        ids[1],
        RawSubmission::default().with_attachment("file", upload("paystub.pdf", "application/pdf", b"%PDF-1.7")),
        &submitter(),
    )
    .await
    .expect("pdf accepted");
    assert!(file.summary.completed);

    let page = view_request(&ctx, &created.token, None, &submitter())
        .await
        .expect("view");
    assert_eq!(page.request.state, RequestState::Completed);
    assert!(page.request.completed_at.is_some());

    let entries = admin::access_log(&ctx, created.request_id).await.expect("log");
    let submits: Vec<Option<ModuleId>> = entries
        .iter()
        .filter(|entry| entry.action == AccessAction::Submit)
        .map(|entry| entry.module_id)
        .collect();
    assert_eq!(submits, vec![Some(ids[1]), Some(ids[0])]);
    assert!(entries
        .iter()
        .filter(|entry| entry.action == AccessAction::Submit)
        .all(|entry| entry.ip_address.as_deref() == Some("203.0.113.9")));
}

#[tokio::test]
async fn two_sided_documents_never_collide() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = engine("sqlite::memory:", &dir).await;
    let (created, ids) = request_with(&ctx, &["insurance_card", "insurance_card"]).await;

    let mut references = Vec::new();
    for module_id in &ids {
        let view = submit_module(
            &ctx,
            *module_id,
            RawSubmission::default()
                .with_attachment("front_file", upload("card.jpg", "image/jpeg", b"front"))
                .with_attachment("back_file", upload("card.jpg", "image/jpeg", b"back")),
            &submitter(),
        )
        .await
        .expect("submit");
        for side in ["front_file", "back_file"] {
            let path = view.data[side]["file_path"].as_str().expect("path");
            references.push((side, path.to_string()));
        }
    }

    let mut unique: Vec<&String> = references.iter().map(|(_, path)| path).collect();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 4);

    for (side, path) in &references {
        assert!(path.starts_with(&format!("{}/insurance_card/", created.token)));
        let bytes = download_attachment(&ctx, path).await.expect("download");
        let expected: &[u8] = if *side == "front_file" { b"front" } else { b"back" };
        assert_eq!(bytes, expected);
    }
    assert_eq!(state_of(&ctx, &created.token).await, RequestState::Completed);
}

#[tokio::test]
async fn expired_request_is_never_rendered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = file_backed_engine(&dir).await;
    let (created, ids) = request_with(&ctx, &["form"]).await;
    submit_module(
        &ctx,
        ids[0],
        RawSubmission::default().with_field("answer", "done"),
        &submitter(),
    )
    .await
    .expect("submit");

    expire_now(&dir, &created).await;

    let err = view_request(&ctx, &created.token, None, &submitter())
        .await
        .expect_err("expired");
    assert_eq!(err.code, ErrorCode::Expired);
    let err = resolve(&ctx, &created.token).await.expect_err("expired");
    assert_eq!(err.code, ErrorCode::Expired);
}

/// Backdates expiry through a second connection to the engine's database file.
async fn expire_now(dir: &tempfile::TempDir, created: &CreatedRequest) {
    let pool = sqlx::SqlitePool::connect(&database_url(dir))
        .await
        .expect("connect");
    let past = chrono::Utc::now() - chrono::Duration::hours(1);
    sqlx::query("UPDATE requests SET expires_at = ? WHERE id = ?")
        .bind(past)
        .bind(created.request_id.0)
        .execute(&pool)
        .await
        .expect("expire");
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_module_submissions_are_serialized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = file_backed_engine(&dir).await;
    let (created, ids) = request_with(&ctx, &["form"]).await;
    let module_id = ids[0];

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                submit_module(
                    &ctx,
                    module_id,
                    RawSubmission::default().with_field("answer", format!("answer {i}")),
                    &Actor::default(),
                )
                .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("submission");
    }

    let module = ctx
        .storage
        .load_module(module_id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(module.version, 9);
    assert_eq!(module.edit_history.len(), 7);

    let submits = admin::access_log(&ctx, created.request_id)
        .await
        .expect("log")
        .into_iter()
        .filter(|entry| entry.action == AccessAction::Submit)
        .count();
    assert_eq!(submits, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sibling_submissions_complete_request_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = file_backed_engine(&dir).await;
    let (created, ids) = request_with(&ctx, &["form", "form", "form", "form"]).await;

    let tasks: Vec<_> = ids
        .iter()
        .map(|module_id| {
            let ctx = ctx.clone();
            let module_id = *module_id;
            tokio::spawn(async move {
                submit_module(
                    &ctx,
                    module_id,
                    RawSubmission::default().with_field("answer", "yes"),
                    &Actor::default(),
                )
                .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("submission");
    }

    let progress = admin::request_progress(&ctx, created.request_id)
        .await
        .expect("progress");
    assert_eq!(progress.ratio(), "4/4");
    assert_eq!(progress.required_remaining, 0);
    assert_eq!(progress.state, RequestState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_module_adds_respect_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut ctx = file_backed_engine(&dir).await;
    ctx.config.max_modules_per_request = 3;
    let (created, _) = request_with(&ctx, &[]).await;
    let request_id = created.request_id;

    let tasks: Vec<_> = (0..8)
        .map(|n| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                admin::add_module(
                    &ctx,
                    request_id,
                    AddModulePayload {
                        kind: "form".into(),
                        label: Some(format!("Question {n}")),
                        description: None,
                        sort_order: Some(n),
                        required: true,
                    },
                )
                .await
            })
        })
        .collect();

    let mut added = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => added += 1,
            Err(err) => {
                assert_eq!(err.code, ErrorCode::Validation);
                assert_eq!(err.field.as_deref(), Some("kind"));
            }
        }
    }
    assert_eq!(added, 3);

    let progress = admin::request_progress(&ctx, request_id)
        .await
        .expect("progress");
    assert_eq!(progress.total_modules, 3);
}
