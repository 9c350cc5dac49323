use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(RequestId);
id_newtype!(ModuleId);
id_newtype!(AccessLogId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Active,
    Completed,
    Expired,
}

impl RequestState {
    /// Expiry wins over completion: a finished request that has expired no longer
    /// accepts reads or submissions.
    pub fn at(
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Self {
        if expires_at.is_some_and(|expires_at| now > expires_at) {
            RequestState::Expired
        } else if completed_at.is_some() {
            RequestState::Completed
        } else {
            RequestState::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    View,
    Submit,
}

impl AccessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessAction::View => "view",
            AccessAction::Submit => "submit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "view" => Some(AccessAction::View),
            "submit" => Some(AccessAction::Submit),
            _ => None,
        }
    }
}

/// Who touched a request, as observed by the boundary layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Textarea,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub label: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: FieldType, label: &str, required: bool) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            label: label.to_string(),
            required,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
