//! Kafka topic consumption engine with best-effort payload decoding and
//! SASL/OAuth connection authentication.
//!
//! Features:
//!
//! - Direct-partition streaming: one concurrent task per partition with
//!   tail/follow/limit semantics and per-partition failure isolation
//! - Consumer groups: broker-coordinated assignment through the same
//!   decode/dispatch path, with optional synchronous offset commits
//! - Best-effort decoding: schema-registry framed payloads, runtime `.proto`
//!   schemas (no code generation), MessagePack, compact-encoded headers.
//!   Decode failures fall back to the raw bytes, never to the caller
//! - Authentication: cached OAuth2 client-credentials tokens with
//!   single-flight refresh, and a SCRAM-SHA-256/512 client state machine
//!
//! The entry point is [`consume::consume`] with a [`consume::ConsumeSession`]
//! describing the run. Record handlers are invoked concurrently from
//! partition tasks and must be safe for concurrent invocation (the `Sync`
//! bound on [`consume::MessageHandler`] enforces this).

/// Connection authentication: OAuth2 token provider and SCRAM client
pub mod auth;

/// Broker connection traits and their rdkafka-backed implementations
pub mod broker;

/// Flag and connection configuration structs
pub mod config;

/// Partition pool, consumer-group bridge, and offset resolution
pub mod consume;

/// Best-effort key/value/header decoding
pub mod decode;

pub mod error;
pub mod message;

// Re-export main types for easy access
pub use broker::{BrokerConnection, KafkaConnection, Record};
pub use config::{BrokerConfig, ConsumeFlags, OffsetSpec, SaslAuth};
pub use consume::{consume, ConsumeError, ConsumeSession, ErrorHandler, MessageHandler};
pub use decode::{registry::SchemaCache, DecodePipeline};
pub use error::{Error, Result};
pub use message::{Header, Message};
