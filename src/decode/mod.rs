//! Best-effort message decoding.
//!
//! Every record passes through a [`DecodePipeline`] before reaching the
//! caller's handler. Decode failures never surface: the raw bytes (lossy
//! UTF-8) are the fallback at every step. Per field, the pipeline tries a
//! configured protobuf type first, then the schema-registry framing, and a
//! whole-message MessagePack mode can override the value result.

pub mod msgpack;
pub mod proto;
pub mod registry;

use crate::broker::Record;
use crate::message::{Header, Message};
use chrono::{DateTime, Utc};
use proto::DescriptorRegistry;
use registry::SchemaCache;
use std::sync::Arc;
use tracing::debug;

/// Per-run decode configuration and collaborators.
#[derive(Default, Clone)]
pub struct DecodePipeline {
    schema_cache: Option<Arc<dyn SchemaCache>>,
    registry: Option<Arc<DescriptorRegistry>>,
    key_proto_type: Option<String>,
    value_proto_type: Option<String>,
    decode_msgpack: bool,
}

impl DecodePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a schema-registry cache for magic-byte framed payloads.
    pub fn with_schema_cache(mut self, cache: Arc<dyn SchemaCache>) -> Self {
        self.schema_cache = Some(cache);
        self
    }

    /// Attach a descriptor registry plus the per-field type names to decode with.
    pub fn with_proto(
        mut self,
        registry: Arc<DescriptorRegistry>,
        key_type: Option<String>,
        value_type: Option<String>,
    ) -> Self {
        self.registry = Some(registry);
        self.key_proto_type = key_type;
        self.value_proto_type = value_type;
        self
    }

    /// Decode values as MessagePack, overriding the per-field result.
    pub fn with_msgpack(mut self, enabled: bool) -> Self {
        self.decode_msgpack = enabled;
        self
    }

    /// Decode a raw record into a [`Message`].
    pub fn decode(&self, record: Record) -> Message {
        let raw_key = record.key.as_deref().unwrap_or_default();
        let raw_value = record.value.as_deref().unwrap_or_default();

        // Schema-id extraction is independent of decode success.
        let key_schema_id = registry::schema_id(raw_key);
        let value_schema_id = registry::schema_id(raw_value);

        let key = self.decode_field(raw_key, self.key_proto_type.as_deref());
        let mut value = self.decode_field(raw_value, self.value_proto_type.as_deref());
        if self.decode_msgpack {
            match msgpack::decode_to_json(raw_value) {
                Ok(text) => value = text,
                Err(e) => {
                    debug!("MessagePack decode failed, keeping prior result: {e}");
                }
            }
        }

        let headers = record
            .headers
            .iter()
            .map(|(k, v)| Header {
                key: k.clone(),
                value: decode_header_value(v),
            })
            .collect();

        Message {
            key,
            value,
            offset: record.offset,
            partition: record.partition,
            headers,
            key_schema_id,
            value_schema_id,
            timestamp: record.timestamp.and_then(millis_to_datetime),
        }
    }

    /// Best-effort decode of one field. Never fails; falls back to lossy text.
    fn decode_field(&self, raw: &[u8], proto_type: Option<&str>) -> String {
        // A configured proto type short-circuits the registry attempt: either
        // it decodes, or the raw bytes pass through.
        if let (Some(type_name), Some(registry)) = (proto_type, self.registry.as_ref()) {
            if registry.resolve(type_name).is_some() {
                match registry.decode_to_json(type_name, raw) {
                    Ok(text) => return text,
                    Err(e) => {
                        debug!("Protobuf decode as {type_name} failed, using raw bytes: {e}");
                        return raw_text(raw);
                    }
                }
            }
            return raw_text(raw);
        }

        if registry::has_registry_header(raw) {
            if let Some(cache) = &self.schema_cache {
                match cache.decode(raw) {
                    Ok(decoded) => return raw_text(&decoded),
                    Err(e) => {
                        debug!("Schema-registry decode failed, using raw bytes: {e}");
                    }
                }
            }
        }

        raw_text(raw)
    }
}

fn raw_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// Leading tag byte marking a length-prefixed short string header value.
const HEADER_TAG_STRING: u8 = 0x01;
/// Leading tag byte marking a big-endian i64 header value.
const HEADER_TAG_INT64: u8 = 0x02;

/// Decode one header value.
///
/// Values are copied through verbatim as text unless the leading byte is one
/// of the two compact-encoding tags; a malformed tagged body also copies the
/// raw bytes unchanged.
pub fn decode_header_value(raw: &[u8]) -> String {
    match raw.first() {
        Some(&HEADER_TAG_STRING) if raw.len() >= 2 => {
            let len = raw[1] as usize;
            let body = &raw[2..];
            if body.len() == len {
                match std::str::from_utf8(body) {
                    Ok(s) => s.to_string(),
                    Err(_) => raw_text(raw),
                }
            } else {
                raw_text(raw)
            }
        }
        Some(&HEADER_TAG_INT64) if raw.len() == 9 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw[1..9]);
            i64::from_be_bytes(buf).to_string()
        }
        _ => raw_text(raw),
    }
}
