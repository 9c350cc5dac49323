use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{AccessAction, AccessLogId, FieldDescriptor, ModuleId, RequestId, RequestState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequestPayload {
    #[serde(default)]
    pub label: Option<String>,
    /// `None` falls back to the configured default expiry; `Some(0)` disables expiry.
    #[serde(default)]
    pub expires_in_days: Option<i64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddModulePayload {
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i64>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedRequest {
    pub request_id: RequestId,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub module_id: ModuleId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub sort_order: i64,
    pub required: bool,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleView {
    #[serde(flatten)]
    pub summary: ModuleSummary,
    pub display_name: String,
    pub fields: Vec<FieldDescriptor>,
    pub version: i64,
    /// Display-safe projection of the module's result data.
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestView {
    pub request_id: RequestId,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    pub modules: Vec<ModuleSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPage {
    pub request: RequestView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<ModuleView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestProgress {
    pub request_id: RequestId,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub state: RequestState,
    pub completed_modules: usize,
    pub total_modules: usize,
    pub required_remaining: usize,
    pub modules_by_kind: BTreeMap<String, usize>,
}

impl RequestProgress {
    /// Operator-facing "X/Y" completion string.
    pub fn ratio(&self) -> String {
        format!("{}/{}", self.completed_modules, self.total_modules)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub access_log_id: AccessLogId,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<ModuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub action: AccessAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleKindSummary {
    pub kind: String,
    pub display_name: String,
}
