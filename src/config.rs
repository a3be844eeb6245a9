//! Consumption and connection configuration.
//!
//! The flag structs derive [`clap::Parser`] so an embedding CLI can wire them
//! directly; the engine itself only reads the parsed values.

use crate::error::{Error, Result};
use clap::Parser;

/// How consumption should start within each partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    /// Start at the lowest retained offset
    Oldest,
    /// Start at the high-water mark
    Newest,
    /// Start at a literal offset
    Literal(i64),
}

/// Flags controlling a single consume run.
#[derive(Debug, Clone, Parser)]
pub struct ConsumeFlags {
    /// Keep streaming past the high-water mark instead of stopping once caught up
    #[clap(long)]
    pub follow: bool,
    /// Replay the N most recent records per partition (0 = disabled).
    /// Takes precedence over --offset.
    #[clap(long, default_value_t = 0)]
    pub tail: i64,
    /// Starting offset: "oldest", "newest", or a literal offset number
    #[clap(long, default_value = "oldest")]
    pub offset: String,
    /// Consumer group name. When set, partition assignment is delegated to
    /// the broker's group coordinator.
    #[clap(long)]
    pub group: Option<String>,
    /// Maximum number of messages to dispatch across all partitions
    #[clap(long)]
    pub limit: Option<u64>,
    /// Explicit partition subset (comma-separated). Empty = all partitions.
    #[clap(long, value_delimiter = ',')]
    pub partitions: Vec<i32>,
    /// Commit each processed offset synchronously (consumer-group mode only)
    #[clap(long)]
    pub commit: bool,
    /// Protobuf message type to decode keys with (requires a descriptor registry)
    #[clap(long)]
    pub key_proto_type: Option<String>,
    /// Protobuf message type to decode values with (requires a descriptor registry)
    #[clap(long)]
    pub value_proto_type: Option<String>,
    /// Decode message values as MessagePack, overriding other value decoders
    #[clap(long)]
    pub decode_msgpack: bool,
}

impl Default for ConsumeFlags {
    fn default() -> Self {
        Self {
            follow: false,
            tail: 0,
            offset: "oldest".to_string(),
            group: None,
            limit: None,
            partitions: Vec::new(),
            commit: false,
            key_proto_type: None,
            value_proto_type: None,
            decode_msgpack: false,
        }
    }
}

impl ConsumeFlags {
    /// Parse the `--offset` flag. Surfaces before any consumption starts.
    pub fn offset_spec(&self) -> Result<OffsetSpec> {
        match self.offset.as_str() {
            "oldest" => Ok(OffsetSpec::Oldest),
            "newest" => Ok(OffsetSpec::Newest),
            other => other
                .parse::<i64>()
                .map(OffsetSpec::Literal)
                .map_err(|_| Error::OffsetParse(other.to_string())),
        }
    }
}

/// SASL mechanism selection for the broker connection.
#[derive(Debug, Clone)]
pub enum SaslAuth {
    /// SCRAM challenge-response with the given hash strength
    Scram {
        hash: crate::auth::scram::ScramHash,
        username: String,
        password: String,
    },
    /// OAUTHBEARER backed by the shared token provider
    OAuthBearer(crate::auth::token::TokenConfig),
}

/// Broker connection configuration.
#[derive(Debug, Clone, Parser)]
pub struct BrokerConfig {
    /// Kafka brokers (comma-separated or multiple --brokers)
    #[clap(long, value_delimiter = ',', required = true)]
    pub brokers: Vec<String>,
    /// Session timeout in milliseconds
    #[clap(long, default_value = "30000")]
    pub session_timeout_ms: String,
    /// SASL authentication, configured programmatically by the caller
    #[clap(skip)]
    pub sasl: Option<SaslAuth>,
}
