//! Typed payloads for the control frame kinds.
//!
//! Field names match the wire documents one-to-one (snake_case), so the
//! structs (de)serialise without rename attributes.

use serde::{Deserialize, Serialize};

use crate::types::{TransferDirection, TransferStatus};

/// Announces this endpoint to the server after (re)connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRegister {
    pub session_id: String,
    pub role: String,
}

impl SessionRegister {
    pub fn client(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            role: "client".into(),
        }
    }
}

/// Outbound request to start an upload or download.
///
/// The direction travels as `transfer_type`: the envelope already owns
/// the top-level `type` key on these flat documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferRequestFrame {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub file_size: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(rename = "transfer_type")]
    pub direction: TransferDirection,
    pub technician: String,
}

/// Server's answer to a transfer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferResponse {
    pub transfer_id: String,
    pub status: TransferStatus,
    #[serde(default)]
    pub message: String,
}

/// Status change pushed by the server during the approval phase.
/// Same shape as [`FileTransferResponse`]; both funnel into one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatusUpdate {
    pub transfer_id: String,
    pub status: TransferStatus,
    #[serde(default)]
    pub message: String,
}

/// This endpoint's decision on an inbound transfer offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferApproval {
    pub transfer_id: String,
    pub approved: bool,
    #[serde(default)]
    pub message: String,
}

/// Actions carried by a `transfer_control` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
    RequestChunk,
}

/// Pause/resume/cancel a transfer, or request (re)transmission of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferControl {
    pub transfer_id: String,
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// Acknowledges receipt of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub transfer_id: String,
    pub chunk_index: u32,
}

/// Server-authoritative progress snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub progress: ProgressBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressBody {
    pub transfer_id: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub speed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<u64>,
}

/// Error report from the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default)]
    pub message: String,
}

/// Inbound transfer offer initiated by a technician.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundTransferRequest {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub file_size: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(rename = "transfer_type", default)]
    pub direction: Option<TransferDirection>,
    #[serde(default)]
    pub technician: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlFrame, FrameKind};

    #[test]
    fn session_register_wire_shape() {
        let frame =
            ControlFrame::new(FrameKind::SessionRegister, &SessionRegister::client("s-9")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["type"], "session_register");
        assert_eq!(json["session_id"], "s-9");
        assert_eq!(json["role"], "client");
    }

    #[test]
    fn request_frame_direction_does_not_shadow_frame_type() {
        let req = FileTransferRequestFrame {
            id: "t-1".into(),
            session_id: "s-1".into(),
            filename: "report.pdf".into(),
            file_size: 4096,
            checksum: "ab".repeat(32),
            direction: TransferDirection::Upload,
            technician: "tech-7".into(),
        };
        let frame = ControlFrame::new(FrameKind::FileTransferRequest, &req).unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["type"], "file_transfer_request");
        assert_eq!(json["transfer_type"], "upload");
        assert_eq!(json["file_size"], 4096);

        let back: FileTransferRequestFrame =
            ControlFrame::decode(&frame.encode()).unwrap().parse_payload().unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn transfer_control_omits_absent_index() {
        let ctrl = TransferControl {
            transfer_id: "t-1".into(),
            action: ControlAction::Pause,
            index: None,
        };
        let json = serde_json::to_string(&ctrl).unwrap();
        assert!(!json.contains("index"));
        assert!(json.contains(r#""action":"pause""#));
    }

    #[test]
    fn request_chunk_carries_index() {
        let ctrl = TransferControl {
            transfer_id: "t-1".into(),
            action: ControlAction::RequestChunk,
            index: Some(0),
        };
        let json = serde_json::to_value(&ctrl).unwrap();
        assert_eq!(json["action"], "request_chunk");
        assert_eq!(json["index"], 0);
    }

    #[test]
    fn response_message_defaults_empty() {
        let parsed: FileTransferResponse =
            serde_json::from_str(r#"{"transfer_id":"t-1","status":"approved"}"#).unwrap();
        assert_eq!(parsed.status, TransferStatus::Approved);
        assert!(parsed.message.is_empty());
    }

    #[test]
    fn progress_response_roundtrip() {
        let body = ProgressBody {
            transfer_id: "t-3".into(),
            bytes_transferred: 1024,
            total_bytes: 8192,
            percentage: 12.5,
            speed: 512,
            remaining_time: Some(14),
        };
        let frame = ControlFrame::new(
            FrameKind::ProgressResponse,
            &ProgressResponse { progress: body.clone() },
        )
        .unwrap();
        let decoded = ControlFrame::decode(&frame.encode()).unwrap();
        let parsed: ProgressResponse = decoded.parse_payload().unwrap();
        assert_eq!(parsed.progress, body);
    }

    #[test]
    fn inbound_request_tolerates_missing_optionals() {
        let parsed: InboundTransferRequest = serde_json::from_str(
            r#"{"id":"t-5","session_id":"s-2","filename":"x.exe","file_size":1000}"#,
        )
        .unwrap();
        assert_eq!(parsed.filename, "x.exe");
        assert!(parsed.direction.is_none());
        assert!(parsed.technician.is_empty());
    }

    #[test]
    fn inbound_request_parses_direction() {
        let parsed: InboundTransferRequest = serde_json::from_str(
            r#"{"id":"t-6","session_id":"s-2","filename":"a.txt","file_size":10,"transfer_type":"download"}"#,
        )
        .unwrap();
        assert_eq!(parsed.direction, Some(TransferDirection::Download));
    }
}
