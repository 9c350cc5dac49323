use super::*;

use chrono::TimeZone;
use serde_json::json;

async fn storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

fn new_request(token: &str) -> NewRequest {
    NewRequest {
        token: token.to_string(),
        label: Some("2025 Camry".to_string()),
        metadata: Map::new(),
        expires_at: None,
    }
}

fn new_module(kind: &str, sort_order: i64, required: bool) -> NewModule {
    NewModule {
        kind: kind.to_string(),
        label: None,
        description: None,
        sort_order,
        required,
    }
}

async fn add(storage: &Storage, request_id: RequestId, new: &NewModule) -> StoredModule {
    match storage.add_module(request_id, new, 16).await.expect("add module") {
        ModuleAddition::Added(module) => module,
        ModuleAddition::LimitReached => panic!("module limit reached"),
    }
}

async fn submit(storage: &Storage, module: &StoredModule, data: Value) -> AppliedSubmission {
    storage
        .apply_submission(&ModuleSubmission {
            module_id: module.module_id,
            expected_version: module.version,
            result_data: &data,
            edit_history: &[],
            submitted_at: Utc::now(),
            actor: &Actor::default(),
        })
        .await
        .expect("apply")
        .expect("version matched")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = storage().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn stores_and_resolves_request_by_token() {
    let storage = storage().await;
    let mut metadata = Map::new();
    metadata.insert("vin".into(), json!("1HGCM82633A004352"));
    let created = storage
        .create_request(&NewRequest {
            metadata,
            ..new_request("tok-a")
        })
        .await
        .expect("request");

    let loaded = storage
        .request_by_token("tok-a")
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(loaded.request_id, created.request_id);
    assert_eq!(loaded.label.as_deref(), Some("2025 Camry"));
    assert_eq!(loaded.metadata.get("vin"), Some(&json!("1HGCM82633A004352")));
    assert!(loaded.completed_at.is_none());

    assert!(storage
        .request_by_token("tok-missing")
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn lists_modules_in_sort_order_then_insertion_order() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-order")).await.expect("request");
    let late = add(&storage, request.request_id, &new_module("form", 5, true)).await;
    let first = add(&storage, request.request_id, &new_module("file", 1, true)).await;
    let tie = add(&storage, request.request_id, &new_module("ssn", 1, true)).await;

    let ids: Vec<ModuleId> = storage
        .list_modules(request.request_id)
        .await
        .expect("modules")
        .into_iter()
        .map(|module| module.module_id)
        .collect();
    assert_eq!(ids, vec![first.module_id, tie.module_id, late.module_id]);
    assert_eq!(storage.next_sort_order(request.request_id).await.expect("next"), 6);
}

#[tokio::test]
async fn module_lookup_is_scoped_to_its_request() {
    let storage = storage().await;
    let a = storage.create_request(&new_request("tok-a")).await.expect("a");
    let b = storage.create_request(&new_request("tok-b")).await.expect("b");
    let module_b = add(&storage, b.request_id, &new_module("form", 0, true)).await;

    assert!(storage
        .load_module_in_request(a.request_id, module_b.module_id)
        .await
        .expect("lookup")
        .is_none());
    assert!(storage
        .load_module_in_request(b.request_id, module_b.module_id)
        .await
        .expect("lookup")
        .is_some());
}

#[tokio::test]
async fn request_completes_only_when_every_required_module_is_done() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-c")).await.expect("request");
    let form = add(&storage, request.request_id, &new_module("form", 0, true)).await;
    let file = add(&storage, request.request_id, &new_module("file", 1, true)).await;
    add(&storage, request.request_id, &new_module("ssn", 2, false)).await;

    let applied = submit(&storage, &form, json!({ "answer": "42" })).await;
    assert!(applied.request_completed_at.is_none());

    let applied = submit(&storage, &file, json!({ "file_path": "x" })).await;
    let completed_at = applied.request_completed_at.expect("completed");

    let module = storage
        .load_module(file.module_id)
        .await
        .expect("load")
        .expect("exists");
    assert!(module.completed);
    assert_eq!(module.version, 2);
    assert_eq!(module.result_data, json!({ "file_path": "x" }));

    let request = storage
        .request_by_id(request.request_id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(request.completed_at, Some(completed_at));
}

#[tokio::test]
async fn request_without_required_modules_never_completes() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-opt")).await.expect("request");
    let optional = add(&storage, request.request_id, &new_module("form", 0, false)).await;
    let reloaded = storage
        .request_by_id(request.request_id)
        .await
        .expect("load")
        .expect("exists");
    assert!(reloaded.completed_at.is_none());

    let applied = submit(&storage, &optional, json!({ "answer": "extra" })).await;
    assert!(applied.request_completed_at.is_none());

    let required = add(&storage, request.request_id, &new_module("file", 1, true)).await;
    let applied = submit(&storage, &required, json!({ "file_path": "x" })).await;
    assert!(applied.request_completed_at.is_some());

    assert_eq!(
        storage.remove_module(required.module_id, true).await.expect("remove"),
        ModuleRemoval::Removed
    );
    let reloaded = storage
        .request_by_id(request.request_id)
        .await
        .expect("load")
        .expect("exists");
    assert!(reloaded.completed_at.is_none());
}

#[tokio::test]
async fn add_module_stops_at_limit_without_writing() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-cap")).await.expect("request");
    let first = storage
        .add_module(request.request_id, &new_module("form", 0, true), 1)
        .await
        .expect("first");
    assert!(matches!(first, ModuleAddition::Added(_)));

    let second = storage
        .add_module(request.request_id, &new_module("file", 1, true), 1)
        .await
        .expect("second");
    assert!(matches!(second, ModuleAddition::LimitReached));

    let modules = storage
        .list_modules(request.request_id)
        .await
        .expect("modules");
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].kind, "form");
}

#[tokio::test]
async fn resubmission_keeps_original_request_completion_time() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-r")).await.expect("request");
    let form = add(&storage, request.request_id, &new_module("form", 0, true)).await;

    let first = submit(&storage, &form, json!({ "answer": "1" })).await;
    let reloaded = storage
        .load_module(form.module_id)
        .await
        .expect("load")
        .expect("exists");
    let second = submit(&storage, &reloaded, json!({ "answer": "2" })).await;

    assert!(first.request_completed_at.is_some());
    assert_eq!(first.request_completed_at, second.request_completed_at);
}

#[tokio::test]
async fn stale_version_is_rejected_without_writing() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-v")).await.expect("request");
    let form = add(&storage, request.request_id, &new_module("form", 0, true)).await;
    submit(&storage, &form, json!({ "answer": "first" })).await;

    let stale = storage
        .apply_submission(&ModuleSubmission {
            module_id: form.module_id,
            expected_version: form.version,
            result_data: &json!({ "answer": "stale" }),
            edit_history: &[],
            submitted_at: Utc::now(),
            actor: &Actor::default(),
        })
        .await
        .expect("apply");
    assert!(stale.is_none());

    let module = storage
        .load_module(form.module_id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(module.result_data, json!({ "answer": "first" }));
    let logs = storage
        .list_access_logs(request.request_id)
        .await
        .expect("logs");
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn adding_required_module_reopens_completed_request() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-o")).await.expect("request");
    let form = add(&storage, request.request_id, &new_module("form", 0, true)).await;
    submit(&storage, &form, json!({ "answer": "done" })).await;

    add(&storage, request.request_id, &new_module("file", 1, true)).await;
    let request = storage
        .request_by_id(request.request_id)
        .await
        .expect("load")
        .expect("exists");
    assert!(request.completed_at.is_none());
}

#[tokio::test]
async fn completed_module_removal_requires_force() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-rm")).await.expect("request");
    let form = add(&storage, request.request_id, &new_module("form", 0, true)).await;
    let pending = add(&storage, request.request_id, &new_module("file", 1, true)).await;
    submit(&storage, &form, json!({ "answer": "x" })).await;

    assert_eq!(
        storage.remove_module(form.module_id, false).await.expect("remove"),
        ModuleRemoval::Completed
    );
    assert_eq!(
        storage.remove_module(ModuleId(9_999), false).await.expect("remove"),
        ModuleRemoval::NotFound
    );

    // Dropping the last pending required module completes the request.
    assert_eq!(
        storage.remove_module(pending.module_id, false).await.expect("remove"),
        ModuleRemoval::Removed
    );
    let reloaded = storage
        .request_by_id(request.request_id)
        .await
        .expect("load")
        .expect("exists");
    assert!(reloaded.completed_at.is_some());

    assert_eq!(
        storage.remove_module(form.module_id, true).await.expect("remove"),
        ModuleRemoval::Removed
    );
}

#[tokio::test]
async fn access_log_is_newest_first_and_append_only() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-log")).await.expect("request");
    let actor = Actor {
        ip_address: Some("203.0.113.7".into()),
        user_agent: Some("curl/8".into()),
    };
    let first = storage
        .record_access(request.request_id, None, &actor, AccessAction::View)
        .await
        .expect("view");
    let second = storage
        .record_access(request.request_id, Some(ModuleId(3)), &actor, AccessAction::View)
        .await
        .expect("view");

    let logs = storage
        .list_access_logs(request.request_id)
        .await
        .expect("logs");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].access_log_id, second);
    assert_eq!(logs[0].module_id, Some(ModuleId(3)));
    assert_eq!(logs[1].access_log_id, first);
    assert_eq!(logs[1].ip_address.as_deref(), Some("203.0.113.7"));

    let tamper = sqlx::query("UPDATE access_log SET action = 'submit' WHERE id = ?")
        .bind(first.0)
        .execute(&storage.pool)
        .await;
    assert!(tamper.is_err());
}

#[tokio::test]
async fn deleting_request_cascades_modules_and_logs() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-del")).await.expect("request");
    let module = add(&storage, request.request_id, &new_module("form", 0, true)).await;
    storage
        .record_access(request.request_id, None, &Actor::default(), AccessAction::View)
        .await
        .expect("view");

    assert!(storage.delete_request(request.request_id).await.expect("delete"));
    assert!(storage
        .load_module(module.module_id)
        .await
        .expect("load")
        .is_none());
    assert!(storage
        .list_access_logs(request.request_id)
        .await
        .expect("logs")
        .is_empty());
    assert!(!storage.delete_request(request.request_id).await.expect("delete"));
}

#[tokio::test]
async fn touch_request_records_last_access() {
    let storage = storage().await;
    let request = storage.create_request(&new_request("tok-t")).await.expect("request");
    let at = Utc
        .with_ymd_and_hms(2025, 6, 7, 20, 35, 0)
        .single()
        .expect("valid timestamp");
    storage
        .touch_request(request.request_id, at)
        .await
        .expect("touch");
    let reloaded = storage
        .request_by_id(request.request_id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(reloaded.last_accessed_at, Some(at));
}
