//! Direct-partition consumption.
//!
//! One task per target partition, each streaming independently from its
//! resolved starting offset. Tasks share nothing but the dispatched-message
//! counter and the caller's handler; a failure inside one task is reported
//! scoped to its partition and never disturbs the siblings.

use super::offsets::{resolve_range, starting_offset};
use super::ConsumeSession;
use crate::broker::BrokerConnection;
use crate::config::ConsumeFlags;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) async fn run(
    conn: Arc<dyn BrokerConnection>,
    topic: &str,
    flags: &ConsumeFlags,
    session: Arc<ConsumeSession>,
    cancel: CancellationToken,
) -> Result<()> {
    let partitions = if flags.partitions.is_empty() {
        conn.partitions(topic).await?
    } else {
        flags.partitions.clone()
    };

    // Limit exhaustion stops the whole run; a child token keeps that signal
    // distinct from the caller's.
    let run_cancel = cancel.child_token();

    let mut handles = Vec::new();
    for partition in partitions {
        // Resolve before spawning so empty partitions never get a task and a
        // resolution failure stays scoped to this partition.
        let range = match resolve_range(conn.as_ref(), topic, partition).await {
            Ok(range) => range,
            Err(e) => {
                session.report(Some(partition), e);
                continue;
            }
        };
        let start = match starting_offset(flags, range) {
            Ok(start) => start,
            Err(e) => {
                session.report(Some(partition), e);
                continue;
            }
        };
        if !flags.follow && range.is_empty() {
            debug!("Partition {partition} is empty, skipping");
            continue;
        }
        if !flags.follow && start >= range.newest {
            debug!("Partition {partition} already caught up at offset {start}, skipping");
            continue;
        }

        let conn = Arc::clone(&conn);
        let session = Arc::clone(&session);
        let flags = flags.clone();
        let topic = topic.to_string();
        let run_cancel = run_cancel.clone();
        handles.push((
            partition,
            tokio::spawn(async move {
                consume_partition(conn, topic, partition, start, flags, session, run_cancel).await
            }),
        ));
    }

    // Block until every spawned task has terminated.
    for (partition, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => session.report(Some(partition), e),
            Err(join_error) => session.report(
                Some(partition),
                Error::Internal(format!("Partition task failed: {join_error}")),
            ),
        }
    }
    Ok(())
}

async fn consume_partition(
    conn: Arc<dyn BrokerConnection>,
    topic: String,
    partition: i32,
    start: i64,
    flags: ConsumeFlags,
    session: Arc<ConsumeSession>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = conn.partition_stream(&topic, partition, start).await?;
    debug!("Consuming partition {partition} of {topic} from offset {start}");

    loop {
        let record = tokio::select! {
            // Cancellation wins over a ready record.
            biased;
            _ = cancel.cancelled() => {
                debug!("Partition {partition} task cancelled");
                return Ok(());
            }
            record = stream.next() => record?,
        };

        let offset = record.offset;
        let count = session.dispatch(record);

        // Exit checks, in priority order.
        if cancel.is_cancelled() {
            return Ok(());
        }
        if let Some(limit) = flags.limit {
            if count >= limit {
                debug!("Message limit {limit} reached, stopping all partition tasks");
                cancel.cancel();
                return Ok(());
            }
        }
        if !flags.follow && offset + 1 >= stream.high_water_mark() {
            debug!("Partition {partition} caught up at offset {offset}");
            return Ok(());
        }
    }
}
