//! Decoded message types.
//!
//! A [`Message`] is what the caller's handler receives: key and value already
//! pushed through the best-effort decode pipeline, plus the Kafka metadata
//! needed to display or commit the record.

use chrono::{DateTime, Utc};

/// A single decoded record header.
///
/// Header values are text after decoding; see
/// [`crate::decode::decode_header_value`] for the compact-encoding rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// A fully decoded Kafka message with metadata.
///
/// Immutable once produced; ownership moves to the handler on dispatch.
#[derive(Debug, Clone)]
pub struct Message {
    /// Decoded key (lossy UTF-8 of the raw bytes when no decoder applied)
    pub key: String,
    /// Decoded value
    pub value: String,
    /// Kafka offset within the partition
    pub offset: i64,
    /// Kafka partition number
    pub partition: i32,
    /// Record headers, in wire order
    pub headers: Vec<Header>,
    /// Schema-registry id embedded in the key, base-10; empty when absent
    pub key_schema_id: String,
    /// Schema-registry id embedded in the value, base-10; empty when absent
    pub value_schema_id: String,
    /// Record timestamp (if the broker supplied one)
    pub timestamp: Option<DateTime<Utc>>,
}
