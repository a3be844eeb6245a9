//! Schema-registry wire format.
//!
//! Registry-framed payloads carry a 5-byte header: one zero magic byte
//! followed by the schema id as a big-endian u32. Decoding is delegated to a
//! [`SchemaCache`] collaborator; this module only detects the framing and
//! extracts the embedded id.

/// Schema-id lookup and payload decoding, provided by the embedding
/// application (typically an HTTP schema-registry client with its own cache).
pub trait SchemaCache: Send + Sync {
    /// Decode a registry-framed payload (header included) into text bytes.
    /// The cache keys on the embedded schema id.
    fn decode(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
}

const MAGIC_BYTE: u8 = 0x00;
const HEADER_LEN: usize = 5;

/// True when `payload` starts with a well-formed registry header.
pub fn has_registry_header(payload: &[u8]) -> bool {
    payload.len() >= HEADER_LEN && payload[0] == MAGIC_BYTE
}

/// Extract the embedded schema id as base-10 text.
///
/// Inspects the raw bytes only; succeeds independently of whether the payload
/// body decodes. Absent or malformed header yields an empty string.
pub fn schema_id(payload: &[u8]) -> String {
    if !has_registry_header(payload) {
        return String::new();
    }
    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    id.to_string()
}
