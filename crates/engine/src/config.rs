//! Engine configuration with clamped setters.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use remotedrop_protocol::{
    DEFAULT_APPROVAL_TIMEOUT, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_TRANSFERS,
    DEFAULT_MAX_FILE_SIZE, MAX_CHUNK_SIZE, MAX_CONCURRENT_TRANSFERS, MIN_APPROVAL_TIMEOUT,
    MIN_CHUNK_SIZE, MIN_CONCURRENT_TRANSFERS, MIN_MAX_FILE_SIZE,
};

use crate::settings::{
    SettingsStore, KEY_ALLOWED_EXTENSIONS, KEY_APPROVAL_TIMEOUT, KEY_AUTO_APPROVAL_ENABLED,
    KEY_MAX_FILE_SIZE, KEY_REMEMBER_DECISION,
};

/// File extensions accepted out of the box.
const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    ".txt", ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".zip", ".rar", ".jpg", ".png", ".gif",
    ".bmp", ".ppt", ".pptx", ".csv", ".rtf", ".odt", ".ods",
];

/// Tunable engine state. Setters clamp to the protocol bounds, so the
/// config is valid by construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub max_concurrent_transfers: usize,
    pub encryption_enabled: bool,
    pub compression_enabled: bool,
    pub max_file_size: u64,
    /// Lowercased, dot-prefixed extensions.
    pub allowed_extensions: BTreeSet<String>,
    pub auto_approval_enabled: bool,
    pub approval_timeout: Duration,
    pub remember_decisions: bool,
    /// Destination directory for technician-initiated downloads.
    pub download_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            encryption_enabled: true,
            compression_enabled: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            auto_approval_enabled: false,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            remember_decisions: true,
            download_dir: default_download_dir(),
        }
    }
}

impl EngineConfig {
    /// Builds a config from persisted settings, falling back to defaults
    /// for anything unset.
    pub fn load_from(store: &SettingsStore) -> Self {
        let mut config = Self::default();
        if let Some(enabled) = store.get_bool(KEY_AUTO_APPROVAL_ENABLED) {
            config.auto_approval_enabled = enabled;
        }
        if let Some(secs) = store.get_u64(KEY_APPROVAL_TIMEOUT) {
            config.set_approval_timeout(Duration::from_secs(secs));
        }
        if let Some(remember) = store.get_bool(KEY_REMEMBER_DECISION) {
            config.remember_decisions = remember;
        }
        if let Some(size) = store.get_u64(KEY_MAX_FILE_SIZE) {
            config.set_max_file_size(size);
        }
        if let Some(extensions) = store.get_strings(KEY_ALLOWED_EXTENSIONS) {
            if !extensions.is_empty() {
                config.allowed_extensions = extensions
                    .iter()
                    .map(|e| normalize_extension(e))
                    .collect();
            }
        }
        config
    }

    // ── Clamped setters ──────────────────────────────────────────────────

    /// Clamps to 1 KiB ..= 1 MiB. Affects sessions created afterwards.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    }

    /// Clamps to 1 ..= 10.
    pub fn set_max_concurrent_transfers(&mut self, max: usize) {
        self.max_concurrent_transfers =
            max.clamp(MIN_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS);
    }

    /// Enforces the 1024-byte floor.
    pub fn set_max_file_size(&mut self, size: u64) {
        self.max_file_size = size.max(MIN_MAX_FILE_SIZE);
    }

    /// Enforces the 5-second floor.
    pub fn set_approval_timeout(&mut self, timeout: Duration) {
        self.approval_timeout = timeout.max(MIN_APPROVAL_TIMEOUT);
    }

    /// Adds an extension; case and leading dot are normalised, so
    /// `".TXT"` and `"txt"` produce the same set membership.
    pub fn add_allowed_extension(&mut self, extension: &str) -> bool {
        self.allowed_extensions.insert(normalize_extension(extension))
    }

    pub fn remove_allowed_extension(&mut self, extension: &str) -> bool {
        self.allowed_extensions.remove(&normalize_extension(extension))
    }
}

/// Lowercases and dot-prefixes an extension.
pub fn normalize_extension(extension: &str) -> String {
    let ext = extension.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

fn default_download_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join("Downloads"))
        .unwrap_or_else(|_| PathBuf::from("."))
}
