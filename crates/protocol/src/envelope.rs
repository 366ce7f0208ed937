//! Control frame envelope.
//!
//! Every control frame is a flat JSON document with a mandatory `type`
//! field, a `timestamp`, and the payload fields of that frame kind spread
//! at the top level. Payload parsing is deferred: the envelope keeps the
//! extra fields as a raw JSON map and `parse_payload` materialises them
//! into a typed struct on demand.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

/// Recognised control frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    SessionRegister,
    Ping,
    Pong,
    FileTransferRequest,
    FileTransferResponse,
    TransferStatusUpdate,
    TransferApproval,
    TransferControl,
    ChunkAck,
    ProgressResponse,
    Error,
    /// Inbound variant: a technician-initiated transfer offer.
    TransferRequest,
}

/// Envelope for all control frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub timestamp: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ControlFrame {
    /// Creates a frame of `kind` with the given payload spread into the
    /// top-level document. The payload must serialise to a JSON object.
    pub fn new<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Self, serde_json::Error> {
        let fields = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(serde::ser::Error::custom(format!(
                    "control payload must be an object, got {other}"
                )));
            }
        };
        Ok(Self {
            kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
            fields,
        })
    }

    /// Creates a payload-less frame (`ping`, `pong`).
    pub fn bare(kind: FrameKind) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
            fields: Map::new(),
        }
    }

    /// Deserialises the payload fields into the given type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| ProtocolError::MalformedControl(e.to_string()))
    }

    /// Serialises the frame to its wire form.
    pub fn encode(&self) -> String {
        // A frame built from valid payloads always serialises.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes a control frame from wire text.
    ///
    /// Fails when the document is not valid JSON, lacks `type`, or carries
    /// an unrecognised `type` value.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedControl(e.to_string()))
    }
}
