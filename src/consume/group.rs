//! Consumer-group consumption.
//!
//! Partition assignment and rebalancing belong to the broker's group
//! coordinator (driven by librdkafka); the bridge only processes whatever
//! records the assignment delivers, through the same decode/dispatch path as
//! the direct-partition pool. The bridge owns no per-session resources.

use super::ConsumeSession;
use crate::broker::BrokerConnection;
use crate::config::ConsumeFlags;
use crate::error::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) async fn run(
    conn: Arc<dyn BrokerConnection>,
    topic: &str,
    group: &str,
    flags: &ConsumeFlags,
    session: Arc<ConsumeSession>,
    cancel: CancellationToken,
) -> Result<()> {
    // Subscription failure is a run-level setup error and aborts the call.
    // With --commit, periodic auto-commit is disabled so offsets advance only
    // after the handler has seen the record.
    let mut stream = conn.group_stream(topic, group, flags.commit).await?;
    debug!("Joined consumer group {group} for topic {topic}");

    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Group consumption cancelled");
                return Ok(());
            }
            record = stream.next() => match record {
                Ok(record) => record,
                Err(e) => {
                    session.report(None, e);
                    return Ok(());
                }
            },
        };

        let commit_target = flags.commit.then(|| record.clone());
        let count = session.dispatch(record);

        // At-least-once: commit only after the handler has seen the record.
        if let Some(record) = commit_target {
            if let Err(e) = stream.commit(&record).await {
                session.report(Some(record.partition), e);
            }
        }

        if cancel.is_cancelled() {
            return Ok(());
        }
        if let Some(limit) = flags.limit {
            if count >= limit {
                debug!("Message limit {limit} reached, leaving group");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::consume::{consume, ConsumeError, ConsumeSession};
    use crate::decode::DecodePipeline;
    use crate::message::Message;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collecting_session() -> (
        Arc<ConsumeSession>,
        Arc<Mutex<Vec<Message>>>,
        Arc<Mutex<Vec<ConsumeError>>>,
    ) {
        let messages: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<ConsumeError>>> = Arc::new(Mutex::new(Vec::new()));
        let messages_in = Arc::clone(&messages);
        let errors_in = Arc::clone(&errors);
        let session = Arc::new(ConsumeSession::new(
            Arc::new(move |msg| messages_in.lock().unwrap().push(msg)),
            Arc::new(move |err| errors_in.lock().unwrap().push(err)),
            DecodePipeline::new(),
        ));
        (session, messages, errors)
    }

    #[tokio::test]
    async fn test_group_path_dispatches_with_limit() {
        let broker = Arc::new(
            MockBroker::default()
                .with_partition(0, 0, &["a", "b"])
                .with_partition(1, 0, &["c"]),
        );
        let (session, messages, _) = collecting_session();
        let flags = ConsumeFlags {
            group: Some("readers".to_string()),
            limit: Some(3),
            ..Default::default()
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            consume(broker, "t", &flags, Arc::clone(&session), CancellationToken::new()),
        )
        .await
        .expect("run must terminate")
        .unwrap();
        assert_eq!(messages.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_commit_flag_commits_next_offset_after_dispatch() {
        let broker = Arc::new(MockBroker::default().with_partition(0, 4, &["x", "y"]));
        let committed = Arc::clone(&broker.committed);
        let manual_commit_requests = Arc::clone(&broker.manual_commit_requests);
        let (session, _, errors) = collecting_session();
        let flags = ConsumeFlags {
            group: Some("readers".to_string()),
            commit: true,
            limit: Some(2),
            ..Default::default()
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            consume(broker, "t", &flags, session, CancellationToken::new()),
        )
        .await
        .expect("run must terminate")
        .unwrap();

        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(*committed.lock().unwrap(), vec![(0, 5), (0, 6)]);
        // --commit requests a manual-commit stream (auto-commit disabled).
        assert_eq!(*manual_commit_requests.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_no_commit_without_flag() {
        let broker = Arc::new(MockBroker::default().with_partition(0, 0, &["x"]));
        let committed = Arc::clone(&broker.committed);
        let manual_commit_requests = Arc::clone(&broker.manual_commit_requests);
        let (session, _, _) = collecting_session();
        let flags = ConsumeFlags {
            group: Some("readers".to_string()),
            limit: Some(1),
            ..Default::default()
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            consume(broker, "t", &flags, session, CancellationToken::new()),
        )
        .await
        .expect("run must terminate")
        .unwrap();
        assert!(committed.lock().unwrap().is_empty());
        assert_eq!(*manual_commit_requests.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_cancelled_group_run_terminates() {
        let broker = Arc::new(MockBroker::default().with_partition(0, 0, &["x"]));
        let (session, _, _) = collecting_session();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let flags = ConsumeFlags {
            group: Some("readers".to_string()),
            ..Default::default()
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            consume(broker, "t", &flags, Arc::clone(&session), cancel),
        )
        .await
        .expect("run must terminate")
        .unwrap();
        assert_eq!(session.dispatched(), 0);
    }

    #[tokio::test]
    async fn test_malformed_offset_flag_aborts_before_consuming() {
        let broker = Arc::new(MockBroker::default().with_partition(0, 0, &["x"]));
        let (session, _, _) = collecting_session();
        let flags = ConsumeFlags {
            group: Some("readers".to_string()),
            offset: "bogus".to_string(),
            ..Default::default()
        };
        let result = consume(broker, "t", &flags, Arc::clone(&session), CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(session.dispatched(), 0);
    }
}
