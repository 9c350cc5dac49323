use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{AccessAction, AccessLogId, Actor, ModuleId, RequestId};

pub mod files;

pub use files::{FileScope, FileStore, LocalFileStore, StorageError, StoredRef};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredRequest {
    pub request_id: RequestId,
    pub token: String,
    pub label: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredModule {
    pub module_id: ModuleId,
    pub request_id: RequestId,
    pub kind: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub sort_order: i64,
    pub required: bool,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_data: Value,
    pub version: i64,
    pub edit_history: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct StoredAccessLog {
    pub access_log_id: AccessLogId,
    pub request_id: RequestId,
    pub module_id: Option<ModuleId>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub action: AccessAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub token: String,
    pub label: Option<String>,
    pub metadata: Map<String, Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewModule {
    pub kind: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub sort_order: i64,
    pub required: bool,
}

/// A handler-produced result ready to be committed onto a module.
#[derive(Debug, Clone)]
pub struct ModuleSubmission<'a> {
    pub module_id: ModuleId,
    /// Version the caller read before validating; a mismatch means another writer won.
    pub expected_version: i64,
    pub result_data: &'a Value,
    pub edit_history: &'a [Value],
    pub submitted_at: DateTime<Utc>,
    pub actor: &'a Actor,
}

#[derive(Debug, Clone)]
pub struct AppliedSubmission {
    pub request_id: RequestId,
    pub request_completed_at: Option<DateTime<Utc>>,
    pub access_log_id: AccessLogId,
}

#[derive(Debug, Clone)]
pub enum ModuleAddition {
    Added(StoredModule),
    /// The request already holds `max_modules` modules; nothing was written.
    LimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRemoval {
    Removed,
    NotFound,
    Completed,
}

const MODULE_COLUMNS: &str = "id, request_id, kind, label, description, sort_order, required, completed, completed_at, result_data, version, edit_history";
const REQUEST_COLUMNS: &str =
    "id, token, label, metadata, created_at, expires_at, completed_at, last_accessed_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_request(&self, new: &NewRequest) -> Result<StoredRequest> {
        let metadata = serde_json::to_string(&new.metadata)?;
        let row = sqlx::query(&format!(
            "INSERT INTO requests (token, label, metadata, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(&new.token)
        .bind(new.label.as_deref())
        .bind(metadata)
        .bind(Utc::now())
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert request")?;
        request_from_row(&row)
    }

    pub async fn request_by_token(&self, token: &str) -> Result<Option<StoredRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE token = ?"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    pub async fn request_by_id(&self, request_id: RequestId) -> Result<Option<StoredRequest>> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?"))
            .bind(request_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    /// Deletes a request together with its modules and access log (cascade).
    pub async fn delete_request(&self, request_id: RequestId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM requests WHERE id = ?")
            .bind(request_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_request(&self, request_id: RequestId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE requests SET last_accessed_at = ? WHERE id = ?")
            .bind(at)
            .bind(request_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Adds a module unless the request already holds `max_modules`, and keeps the
    /// request's completion consistent with the new module set. The count and the
    /// insert are one statement, so concurrent adds cannot overshoot the limit. A
    /// required module added to a completed request reopens it.
    pub async fn add_module(
        &self,
        request_id: RequestId,
        new: &NewModule,
        max_modules: usize,
    ) -> Result<ModuleAddition> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO modules (request_id, kind, label, description, sort_order, required)
             SELECT ?, ?, ?, ?, ?, ?
             WHERE (SELECT COUNT(*) FROM modules WHERE request_id = ?) < ?
             RETURNING {MODULE_COLUMNS}"
        ))
        .bind(request_id.0)
        .bind(&new.kind)
        .bind(new.label.as_deref())
        .bind(new.description.as_deref())
        .bind(new.sort_order)
        .bind(new.required)
        .bind(request_id.0)
        .bind(i64::try_from(max_modules).unwrap_or(i64::MAX))
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert module")?;
        let Some(row) = row else {
            return Ok(ModuleAddition::LimitReached);
        };
        let module = module_from_row(&row)?;

        if new.required {
            sqlx::query("UPDATE requests SET completed_at = NULL WHERE id = ?")
                .bind(request_id.0)
                .execute(&mut *tx)
                .await?;
        } else {
            refresh_request_completion(&mut *tx, request_id, Utc::now()).await?;
        }

        tx.commit().await?;
        Ok(ModuleAddition::Added(module))
    }

    pub async fn next_sort_order(&self, request_id: RequestId) -> Result<i64> {
        let next = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM modules WHERE request_id = ?",
        )
        .bind(request_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    /// Modules in presentation order: `sort_order`, then insertion order.
    pub async fn list_modules(&self, request_id: RequestId) -> Result<Vec<StoredModule>> {
        let rows = sqlx::query(&format!(
            "SELECT {MODULE_COLUMNS} FROM modules
             WHERE request_id = ?
             ORDER BY sort_order ASC, id ASC"
        ))
        .bind(request_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(module_from_row).collect()
    }

    pub async fn load_module(&self, module_id: ModuleId) -> Result<Option<StoredModule>> {
        let row = sqlx::query(&format!("SELECT {MODULE_COLUMNS} FROM modules WHERE id = ?"))
            .bind(module_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(module_from_row).transpose()
    }

    /// Loads a module only if it belongs to `request_id`.
    pub async fn load_module_in_request(
        &self,
        request_id: RequestId,
        module_id: ModuleId,
    ) -> Result<Option<StoredModule>> {
        let row = sqlx::query(&format!(
            "SELECT {MODULE_COLUMNS} FROM modules WHERE id = ? AND request_id = ?"
        ))
        .bind(module_id.0)
        .bind(request_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(module_from_row).transpose()
    }

    /// Removes a module unless it is already completed; `force` overrides that guard.
    pub async fn remove_module(&self, module_id: ModuleId, force: bool) -> Result<ModuleRemoval> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM modules WHERE id = ? AND (completed = 0 OR ?) RETURNING request_id",
        )
        .bind(module_id.0)
        .bind(force)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = deleted else {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM modules WHERE id = ?")
                .bind(module_id.0)
                .fetch_optional(&mut *tx)
                .await?;
            return Ok(if exists.is_some() {
                ModuleRemoval::Completed
            } else {
                ModuleRemoval::NotFound
            });
        };

        let request_id = RequestId(row.get::<i64, _>(0));
        refresh_request_completion(&mut *tx, request_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(ModuleRemoval::Removed)
    }

    /// Commits a submission: module result and completion, request completion and
    /// the `submit` access entry land in one transaction, in that order.
    ///
    /// Returns `None` when the module's version moved since the caller read it; in
    /// that case nothing is written.
    pub async fn apply_submission(
        &self,
        submission: &ModuleSubmission<'_>,
    ) -> Result<Option<AppliedSubmission>> {
        let result_data = serde_json::to_string(submission.result_data)?;
        let edit_history = serde_json::to_string(submission.edit_history)?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE modules
             SET result_data = ?, completed = 1, completed_at = ?, edit_history = ?, version = version + 1
             WHERE id = ? AND version = ?
             RETURNING request_id",
        )
        .bind(result_data)
        .bind(submission.submitted_at)
        .bind(edit_history)
        .bind(submission.module_id.0)
        .bind(submission.expected_version)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to update module result")?;

        let Some(row) = updated else {
            return Ok(None);
        };
        let request_id = RequestId(row.get::<i64, _>(0));

        let request_completed_at =
            refresh_request_completion(&mut *tx, request_id, submission.submitted_at).await?;

        let access_log_id = insert_access_log(
            &mut *tx,
            request_id,
            Some(submission.module_id),
            submission.actor,
            AccessAction::Submit,
            submission.submitted_at,
        )
        .await?;

        tx.commit().await.context("failed to commit submission")?;
        Ok(Some(AppliedSubmission {
            request_id,
            request_completed_at,
            access_log_id,
        }))
    }

    pub async fn record_access(
        &self,
        request_id: RequestId,
        module_id: Option<ModuleId>,
        actor: &Actor,
        action: AccessAction,
    ) -> Result<AccessLogId> {
        let mut conn = self.pool.acquire().await?;
        insert_access_log(&mut *conn, request_id, module_id, actor, action, Utc::now()).await
    }

    /// Access entries for a request, newest first.
    pub async fn list_access_logs(&self, request_id: RequestId) -> Result<Vec<StoredAccessLog>> {
        let rows = sqlx::query(
            "SELECT id, request_id, module_id, ip_address, user_agent, action, timestamp
             FROM access_log
             WHERE request_id = ?
             ORDER BY id DESC",
        )
        .bind(request_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let raw_action = r.get::<String, _>(5);
                let action = AccessAction::parse(&raw_action)
                    .with_context(|| format!("unknown access action '{raw_action}'"))?;
                Ok(StoredAccessLog {
                    access_log_id: AccessLogId(r.get::<i64, _>(0)),
                    request_id: RequestId(r.get::<i64, _>(1)),
                    module_id: r.get::<Option<i64>, _>(2).map(ModuleId),
                    ip_address: r.get::<Option<String>, _>(3),
                    user_agent: r.get::<Option<String>, _>(4),
                    action,
                    timestamp: r.get::<DateTime<Utc>, _>(6),
                })
            })
            .collect()
    }
}

/// Sets `completed_at` once the request has required modules and all of them are
/// complete, and clears it otherwise. A request with no required module is never
/// complete, matching how it starts out. Submissions only ever complete modules, so
/// on that path this never clears a completion.
async fn refresh_request_completion(
    conn: &mut SqliteConnection,
    request_id: RequestId,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        "UPDATE requests
         SET completed_at = CASE
             WHEN NOT EXISTS (
                 SELECT 1 FROM modules
                 WHERE modules.request_id = requests.id AND required = 1
             ) THEN NULL
             WHEN EXISTS (
                 SELECT 1 FROM modules
                 WHERE modules.request_id = requests.id AND required = 1 AND completed = 0
             ) THEN NULL
             ELSE COALESCE(completed_at, ?)
         END
         WHERE id = ?
         RETURNING completed_at",
    )
    .bind(now)
    .bind(request_id.0)
    .fetch_one(&mut *conn)
    .await
    .context("failed to recompute request completion")?;
    Ok(row.get::<Option<DateTime<Utc>>, _>(0))
}

async fn insert_access_log(
    conn: &mut SqliteConnection,
    request_id: RequestId,
    module_id: Option<ModuleId>,
    actor: &Actor,
    action: AccessAction,
    at: DateTime<Utc>,
) -> Result<AccessLogId> {
    let rec = sqlx::query(
        "INSERT INTO access_log (request_id, module_id, ip_address, user_agent, action, timestamp)
         VALUES (?, ?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(request_id.0)
    .bind(module_id.map(|id| id.0))
    .bind(actor.ip_address.as_deref())
    .bind(actor.user_agent.as_deref())
    .bind(action.as_str())
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .context("failed to append access log entry")?;
    Ok(AccessLogId(rec.get::<i64, _>(0)))
}

fn request_from_row(r: &SqliteRow) -> Result<StoredRequest> {
    let metadata: Map<String, Value> = serde_json::from_str(&r.get::<String, _>("metadata"))
        .context("request metadata is not a JSON object")?;
    Ok(StoredRequest {
        request_id: RequestId(r.get::<i64, _>("id")),
        token: r.get::<String, _>("token"),
        label: r.get::<Option<String>, _>("label"),
        metadata,
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
        expires_at: r.get::<Option<DateTime<Utc>>, _>("expires_at"),
        completed_at: r.get::<Option<DateTime<Utc>>, _>("completed_at"),
        last_accessed_at: r.get::<Option<DateTime<Utc>>, _>("last_accessed_at"),
    })
}

fn module_from_row(r: &SqliteRow) -> Result<StoredModule> {
    let module_id = ModuleId(r.get::<i64, _>("id"));
    let result_data: Value = serde_json::from_str(&r.get::<String, _>("result_data"))
        .with_context(|| format!("module {} has malformed result_data", module_id.0))?;
    let edit_history: Vec<Value> = serde_json::from_str(&r.get::<String, _>("edit_history"))
        .with_context(|| format!("module {} has malformed edit_history", module_id.0))?;
    Ok(StoredModule {
        module_id,
        request_id: RequestId(r.get::<i64, _>("request_id")),
        kind: r.get::<String, _>("kind"),
        label: r.get::<Option<String>, _>("label"),
        description: r.get::<Option<String>, _>("description"),
        sort_order: r.get::<i64, _>("sort_order"),
        required: r.get::<bool, _>("required"),
        completed: r.get::<bool, _>("completed"),
        completed_at: r.get::<Option<DateTime<Utc>>, _>("completed_at"),
        result_data,
        version: r.get::<i64, _>("version"),
        edit_history,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
