use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use engine::EngineConfig;
use handlers::{HandlerSettings, SecretKey};
use tracing::warn;

const SETTING_KEYS: &[&str] = &[
    "bind_addr",
    "database_url",
    "upload_root",
    "encryption_key",
    "max_upload_bytes",
    "default_expiry_days",
    "max_modules_per_request",
    "storage_timeout_ms",
];

/// Room for multipart framing and text fields next to two full-size attachments.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub upload_root: String,
    /// Base64 of 32 bytes; required at startup.
    pub encryption_key: Option<String>,
    pub max_upload_bytes: usize,
    pub default_expiry_days: i64,
    pub max_modules_per_request: usize,
    pub storage_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/filemaster.db".into(),
            upload_root: "./data/uploads".into(),
            encryption_key: None,
            max_upload_bytes: 10 * 1024 * 1024,
            default_expiry_days: 7,
            max_modules_per_request: 20,
            storage_timeout_ms: 30_000,
        }
    }
}

impl Settings {
    pub fn handler_settings(&self) -> anyhow::Result<HandlerSettings> {
        let raw = self
            .encryption_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .context("ENCRYPTION_KEY must be set to the base64 encoding of 32 random bytes")?;
        let encryption_key =
            SecretKey::from_base64(raw).context("ENCRYPTION_KEY is not a usable key")?;
        Ok(HandlerSettings {
            encryption_key,
            max_upload_bytes: self.max_upload_bytes,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_expiry_days: self.default_expiry_days,
            max_modules_per_request: self.max_modules_per_request,
            storage_timeout: Duration::from_millis(self.storage_timeout_ms),
        }
    }

    /// Largest request body the router accepts.
    pub fn body_limit(&self) -> usize {
        self.max_upload_bytes
            .saturating_mul(2)
            .saturating_add(MULTIPART_OVERHEAD_BYTES)
    }

    fn apply(&mut self, key: &str, value: String) {
        match key {
            "bind_addr" => self.bind_addr = value,
            "database_url" => self.database_url = value,
            "upload_root" => self.upload_root = value,
            "encryption_key" => self.encryption_key = Some(value),
            "max_upload_bytes" => set_parsed(&mut self.max_upload_bytes, key, &value),
            "default_expiry_days" => set_parsed(&mut self.default_expiry_days, key, &value),
            "max_modules_per_request" => {
                set_parsed(&mut self.max_modules_per_request, key, &value)
            }
            "storage_timeout_ms" => set_parsed(&mut self.storage_timeout_ms, key, &value),
            _ => {}
        }
    }
}

/// Defaults, then `server.toml`, then environment variables. Each key may be given
/// by its upper-case name (`DATABASE_URL`) or with the `APP__` prefix, which wins.
pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    resolve_settings(file.as_deref(), |name| std::env::var(name).ok())
}

fn resolve_settings(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<toml::Table>(raw) {
            Ok(table) => {
                for (key, value) in table {
                    let value = match value {
                        toml::Value::String(value) => value,
                        other => other.to_string(),
                    };
                    settings.apply(&key, value);
                }
            }
            Err(error) => warn!(%error, "ignoring unparsable server.toml"),
        }
    }

    for key in SETTING_KEYS {
        let name = key.to_ascii_uppercase();
        if let Some(value) = env(&name) {
            settings.apply(key, value);
        }
        if let Some(value) = env(&format!("APP__{name}")) {
            settings.apply(key, value);
        }
    }

    settings
}

fn set_parsed<T: FromStr>(slot: &mut T, key: &str, raw: &str) {
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = raw, "ignoring invalid setting"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        return sqlite_url_for(&path.replace('\\', "/"));
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url);
    sqlite_url_for(&path.replace('\\', "/"))
}

/// Drive-letter paths keep a single colon so the drive is not read as a host.
fn sqlite_url_for(path: &str) -> String {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
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
#[path = "tests/config_tests.rs"]
mod tests;
