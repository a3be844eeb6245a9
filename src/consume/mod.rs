//! Consumption engine entry point.
//!
//! A run is described by a [`ConsumeSession`] (handler, error callback,
//! decode pipeline; explicit per-run state, never process globals) plus
//! [`crate::config::ConsumeFlags`]. [`consume`] branches between the
//! direct-partition pool and the consumer-group bridge; both routes every
//! record through the decode pipeline before the handler sees it.

pub mod group;
pub mod offsets;
pub mod pool;

use crate::broker::{BrokerConnection, Record};
use crate::config::ConsumeFlags;
use crate::decode::DecodePipeline;
use crate::error::{Error, Result};
use crate::message::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receives each decoded message.
///
/// Invoked concurrently from multiple partition tasks; the `Sync` bound is
/// the contract, and the engine does not serialize handler invocations.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Receives error reports, scoped to a partition when one is responsible.
pub type ErrorHandler = Arc<dyn Fn(ConsumeError) + Send + Sync>;

/// An error report delivered through the error callback.
#[derive(Debug)]
pub struct ConsumeError {
    /// The partition the failure is scoped to; `None` for run-level errors.
    pub partition: Option<i32>,
    pub error: Error,
}

/// Per-run state shared by all consumption tasks.
pub struct ConsumeSession {
    handler: MessageHandler,
    error_handler: ErrorHandler,
    pipeline: DecodePipeline,
    dispatched: AtomicU64,
}

impl ConsumeSession {
    pub fn new(
        handler: MessageHandler,
        error_handler: ErrorHandler,
        pipeline: DecodePipeline,
    ) -> Self {
        Self {
            handler,
            error_handler,
            pipeline,
            dispatched: AtomicU64::new(0),
        }
    }

    /// Decode and hand one record to the handler. Returns the cumulative
    /// dispatched count including this record.
    pub(crate) fn dispatch(&self, record: Record) -> u64 {
        let message = self.pipeline.decode(record);
        (self.handler)(message);
        self.dispatched.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn report(&self, partition: Option<i32>, error: Error) {
        (self.error_handler)(ConsumeError { partition, error });
    }

    /// Total messages dispatched so far in this run.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }
}

/// Consume `topic` until cancelled, caught up, or the message limit is hit.
///
/// Run-level setup failures (offset flag parsing, group subscription) abort
/// the call before any record is dispatched; per-partition failures are
/// reported through the session's error callback instead.
pub async fn consume(
    conn: Arc<dyn BrokerConnection>,
    topic: &str,
    flags: &ConsumeFlags,
    session: Arc<ConsumeSession>,
    cancel: CancellationToken,
) -> Result<()> {
    // Fail malformed offset flags before anything starts.
    flags.offset_spec()?;
    match &flags.group {
        Some(group) => group::run(conn, topic, group, flags, session, cancel).await,
        None => pool::run(conn, topic, flags, session, cancel).await,
    }
}
