//! Persistent key/value settings.
//!
//! Settings are cached in memory and persisted to a JSON file on every
//! write. Keys are grouped with a `Group/Name` convention:
//! `AutoApproval/*`, `Security/*`, and `RememberedDecisions/<transfer id>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, warn};

pub const KEY_AUTO_APPROVAL_ENABLED: &str = "AutoApproval/Enabled";
pub const KEY_APPROVAL_TIMEOUT: &str = "AutoApproval/Timeout";
pub const KEY_REMEMBER_DECISION: &str = "AutoApproval/RememberDecision";
pub const KEY_MAX_FILE_SIZE: &str = "Security/MaxFileSize";
pub const KEY_ALLOWED_EXTENSIONS: &str = "Security/AllowedExtensions";

const REMEMBERED_PREFIX: &str = "RememberedDecisions/";

/// Key/value settings store backed by a JSON file.
pub struct SettingsStore {
    path: Option<PathBuf>,
    values: RwLock<BTreeMap<String, Value>>,
}

impl SettingsStore {
    /// Creates a store backed by `path`, loading existing values.
    pub fn new(path: PathBuf) -> std::io::Result<Self> {
        let values = load_values(&path)?;
        Ok(Self {
            path: Some(path),
            values: RwLock::new(values),
        })
    }

    /// Creates a store that keeps values only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    /// Default on-disk location under the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("remotedrop").join("settings.json"))
    }

    // ── Typed getters ────────────────────────────────────────────────────

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.read().unwrap().get(key)?.as_bool()
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.read().unwrap().get(key)?.as_u64()
    }

    pub fn get_strings(&self, key: &str) -> Option<Vec<String>> {
        let values = self.values.read().unwrap();
        let list = values.get(key)?.as_array()?;
        Some(
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    // ── Setters (persist on every write) ─────────────────────────────────

    pub fn set(&self, key: &str, value: Value) {
        self.values.write().unwrap().insert(key.to_string(), value);
        self.persist();
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, Value::Bool(value));
    }

    pub fn set_u64(&self, key: &str, value: u64) {
        self.set(key, Value::from(value));
    }

    pub fn set_strings(&self, key: &str, values: &[String]) {
        self.set(key, Value::from(values.to_vec()));
    }

    // ── Remembered decisions ─────────────────────────────────────────────

    /// Looks up a persisted decision for a request id.
    pub fn remembered_decision(&self, transfer_id: &str) -> Option<bool> {
        self.get_bool(&format!("{REMEMBERED_PREFIX}{transfer_id}"))
    }

    /// Persists a decision keyed by request id.
    pub fn remember_decision(&self, transfer_id: &str, approved: bool) {
        self.set_bool(&format!("{REMEMBERED_PREFIX}{transfer_id}"), approved);
    }

    /// All persisted decisions, keyed by request id.
    pub fn remembered_decisions(&self) -> std::collections::HashMap<String, bool> {
        self.values
            .read()
            .unwrap()
            .iter()
            .filter_map(|(key, value)| {
                let id = key.strip_prefix(REMEMBERED_PREFIX)?;
                Some((id.to_string(), value.as_bool()?))
            })
            .collect()
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        let values = self.values.read().unwrap();
        let json = match serde_json::to_string_pretty(&*values) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialise settings");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create settings directory");
                return;
            }
        }
        if let Err(e) = std::fs::write(path, json) {
            warn!(error = %e, path = %path.display(), "failed to persist settings");
        } else {
            debug!(count = values.len(), path = %path.display(), "persisted settings");
        }
    }
}

fn load_values(path: &Path) -> std::io::Result<BTreeMap<String, Value>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    match serde_json::from_str(&data) {
        Ok(values) => Ok(values),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "settings file corrupted, starting fresh");
            Ok(BTreeMap::new())
        }
    }
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
