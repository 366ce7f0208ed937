//! Transfer request: immutable after creation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use remotedrop_protocol::TransferDirection;

/// Everything that describes one requested transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Unique opaque transfer id.
    pub id: String,
    /// Remote-support session this transfer belongs to.
    pub session_id: String,
    /// Display name / relative path of the file.
    pub filename: String,
    /// Total size in bytes; 0 means unknown (inbound download before the
    /// first status frame).
    pub file_size: u64,
    /// Whole-file SHA-256 (lowercase hex); empty until computed.
    #[serde(default)]
    pub checksum: String,
    pub direction: TransferDirection,
    /// Identifier of the requesting technician.
    #[serde(default)]
    pub technician: String,
    /// Absolute path on this host: source for uploads, destination for
    /// downloads.
    pub local_path: PathBuf,
    /// Path on the operator side, display-only.
    #[serde(default)]
    pub remote_path: String,
    /// Opaque structured data carried with the request.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TransferRequest {
    /// Request for sending a local file to the operator.
    pub fn upload(
        id: impl Into<String>,
        session_id: impl Into<String>,
        local_path: impl Into<PathBuf>,
        file_size: u64,
        checksum: impl Into<String>,
        technician: impl Into<String>,
    ) -> Self {
        let local_path = local_path.into();
        let filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            filename,
            file_size,
            checksum: checksum.into(),
            direction: TransferDirection::Upload,
            technician: technician.into(),
            local_path,
            remote_path: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Request for receiving a file from the operator.
    pub fn download(
        id: impl Into<String>,
        session_id: impl Into<String>,
        filename: impl Into<String>,
        local_path: impl Into<PathBuf>,
        technician: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            filename: filename.into(),
            file_size: 0,
            checksum: String::new(),
            direction: TransferDirection::Download,
            technician: technician.into(),
            local_path: local_path.into(),
            remote_path: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Lowercased filename extension including the leading dot, or an
    /// empty string when the filename has none.
    pub fn extension(&self) -> String {
        match self.filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                format!(".{}", ext.to_lowercase())
            }
            _ => String::new(),
        }
    }
}
