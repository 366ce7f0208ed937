//! Binary chunk frames: 4-byte big-endian header length + JSON header + payload.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// JSON header preceding the chunk payload on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkHeader {
    transfer_id: String,
    chunk_index: u32,
    checksum: String,
    is_last: bool,
}

/// One slice of a file in flight.
///
/// All chunks except the last carry exactly the configured chunk size;
/// `checksum` is the lowercase hex SHA-256 of `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub checksum: String,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl FileChunk {
    /// Encodes the chunk for the wire:
    /// `[4 bytes: header_len (big-endian)][header_len bytes: JSON][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let header = ChunkHeader {
            transfer_id: self.transfer_id.clone(),
            chunk_index: self.chunk_index,
            checksum: self.checksum.clone(),
            is_last: self.is_last,
        };
        // Header structs with string/number fields always serialise.
        let header_json = serde_json::to_vec(&header).unwrap_or_default();

        let mut buf = Vec::with_capacity(4 + header_json.len() + self.data.len());
        buf.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header_json);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parses a raw binary frame into a chunk.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::TooShort);
        }

        let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if header_len > data.len() - 4 {
            return Err(ProtocolError::HeaderTruncated {
                expected: header_len,
                got: data.len() - 4,
            });
        }

        let header: ChunkHeader = serde_json::from_slice(&data[4..4 + header_len])
            .map_err(|e| ProtocolError::InvalidHeader(e.to_string()))?;

        Ok(Self {
            transfer_id: header.transfer_id,
            chunk_index: header.chunk_index,
            checksum: header.checksum,
            is_last: header.is_last,
            data: data[4 + header_len..].to_vec(),
        })
    }
}
