//! Broker connection seam.
//!
//! The consumption paths talk to the broker through the [`BrokerConnection`],
//! [`PartitionStream`] and [`GroupStream`] traits so tests can substitute
//! in-memory fakes. The real implementations wrap rdkafka's `StreamConsumer`;
//! partition discovery, fetching and group coordination are all delegated to
//! librdkafka.

use crate::auth::token::TokenProvider;
use crate::config::{BrokerConfig, SaslAuth};
use crate::consume::offsets::PartitionOffsets;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::client::OAuthToken;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as RdkafkaConsumer, ConsumerContext, StreamConsumer};
use rdkafka::message::{Headers, Message as RdkafkaMessage};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const WATERMARK_TIMEOUT: Duration = Duration::from_secs(10);

/// A raw record as fetched from the broker, before decoding.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub offset: i64,
    pub partition: i32,
    /// Header key/value pairs in wire order
    pub headers: Vec<(String, Bytes)>,
    /// Milliseconds since epoch, if the broker supplied a timestamp
    pub timestamp: Option<i64>,
}

/// Read-only broker operations used to set up a consume run.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Discover the partition ids of a topic.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// Query the oldest retained offset and the high-water mark of a partition.
    async fn offset_range(&self, topic: &str, partition: i32) -> Result<PartitionOffsets>;

    /// Open a record stream over one partition, starting at `start`.
    async fn partition_stream(
        &self,
        topic: &str,
        partition: i32,
        start: i64,
    ) -> Result<Box<dyn PartitionStream>>;

    /// Join a consumer group and stream records from the assigned partitions.
    /// With `manual_commit` the consumer's periodic auto-commit is disabled
    /// and offsets move only through [`GroupStream::commit`].
    async fn group_stream(
        &self,
        topic: &str,
        group: &str,
        manual_commit: bool,
    ) -> Result<Box<dyn GroupStream>>;
}

/// A stream of records from a single partition.
#[async_trait]
pub trait PartitionStream: Send {
    /// Wait for the next record. Cancellation is handled by the caller
    /// selecting over this future.
    async fn next(&mut self) -> Result<Record>;

    /// The partition's high-water mark as of the latest fetch.
    fn high_water_mark(&self) -> i64;
}

/// A stream of records from broker-assigned partitions.
#[async_trait]
pub trait GroupStream: Send {
    async fn next(&mut self) -> Result<Record>;

    /// Synchronously commit `record.offset + 1` for the record's partition.
    async fn commit(&mut self, record: &Record) -> Result<()>;
}

/// Client context shared by every consumer the engine creates.
///
/// Carries the token provider when the connection authenticates with
/// OAUTHBEARER; librdkafka calls back into it whenever the current token
/// approaches expiry.
pub struct EngineContext {
    token_provider: Option<Arc<TokenProvider>>,
    /// Handle of the runtime that owns the provider; librdkafka invokes the
    /// token callback from its own threads.
    runtime: tokio::runtime::Handle,
}

impl ClientContext for EngineContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> std::result::Result<OAuthToken, Box<dyn std::error::Error>> {
        let provider = self
            .token_provider
            .as_ref()
            .ok_or("no token provider configured")?;
        let token = self.runtime.block_on(provider.token())?;
        Ok(OAuthToken {
            token,
            principal_name: String::new(),
            lifetime_ms: provider.expires_at_epoch_ms(),
        })
    }
}

impl ConsumerContext for EngineContext {}

type EngineConsumer = StreamConsumer<EngineContext>;

/// rdkafka-backed [`BrokerConnection`].
pub struct KafkaConnection {
    config: BrokerConfig,
    /// Used for metadata and watermark queries only; per-partition and group
    /// streams get their own consumers.
    metadata_consumer: Arc<EngineConsumer>,
    token_provider: Option<Arc<TokenProvider>>,
}

impl KafkaConnection {
    /// Connect to the brokers described by `config`.
    ///
    /// OAUTHBEARER auth bootstraps the shared token provider here, so missing
    /// credentials fail the connection rather than the first fetch.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let token_provider = match &config.sasl {
            Some(SaslAuth::OAuthBearer(token_config)) => {
                Some(TokenProvider::shared(token_config.clone()).await?)
            }
            _ => None,
        };
        let metadata_consumer = Arc::new(create_consumer(
            &config,
            "kaftail-metadata",
            false,
            token_provider.clone(),
        )?);
        Ok(Self {
            config,
            metadata_consumer,
            token_provider,
        })
    }
}

fn build_client_config(
    config: &BrokerConfig,
    group_id: &str,
    auto_commit: bool,
) -> Result<ClientConfig> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("group.id", group_id)
        .set("session.timeout.ms", &config.session_timeout_ms)
        // Must stay false wherever this engine manages offsets itself, or
        // librdkafka commits them behind our back.
        .set("enable.auto.commit", auto_commit.to_string())
        .set("enable.partition.eof", "false");

    match &config.sasl {
        Some(SaslAuth::Scram {
            hash,
            username,
            password,
        }) => {
            // The handshake itself runs inside librdkafka; validate the
            // credentials eagerly with our own state machine so an empty or
            // malformed identity fails at connect time.
            let mut probe = crate::auth::scram::ScramClient::new(*hash);
            probe.begin(username, password, "")?;
            client_config
                .set("security.protocol", "sasl_ssl")
                .set("sasl.mechanisms", hash.mechanism_name())
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
        Some(SaslAuth::OAuthBearer(_)) => {
            client_config
                .set("security.protocol", "sasl_ssl")
                .set("sasl.mechanisms", "OAUTHBEARER");
        }
        None => {}
    }

    Ok(client_config)
}

fn create_consumer(
    config: &BrokerConfig,
    group_id: &str,
    auto_commit: bool,
    token_provider: Option<Arc<TokenProvider>>,
) -> Result<EngineConsumer> {
    let client_config = build_client_config(config, group_id, auto_commit)?;
    let context = EngineContext {
        token_provider,
        runtime: tokio::runtime::Handle::current(),
    };
    let consumer = client_config
        .create_with_context(context)
        .map_err(|e| Error::Connection(format!("Failed to create consumer: {e}")))?;
    Ok(consumer)
}

#[async_trait]
impl BrokerConnection for KafkaConnection {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let consumer = Arc::clone(&self.metadata_consumer);
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(|e| Error::Connection(format!("Failed to fetch metadata: {e}")))?;
            let topic_metadata = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| Error::Connection(format!("Unknown topic: {topic}")))?;
            Ok(topic_metadata
                .partitions()
                .iter()
                .map(|p| p.id())
                .collect())
        })
        .await
        .map_err(|e| Error::Internal(format!("Metadata task failed: {e}")))?
    }

    async fn offset_range(&self, topic: &str, partition: i32) -> Result<PartitionOffsets> {
        let consumer = Arc::clone(&self.metadata_consumer);
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            let (oldest, newest) = consumer
                .fetch_watermarks(&topic, partition, WATERMARK_TIMEOUT)
                .map_err(|e| Error::Connection(format!("Failed to fetch watermarks: {e}")))?;
            Ok(PartitionOffsets { oldest, newest })
        })
        .await
        .map_err(|e| Error::Internal(format!("Watermark task failed: {e}")))?
    }

    async fn partition_stream(
        &self,
        topic: &str,
        partition: i32,
        start: i64,
    ) -> Result<Box<dyn PartitionStream>> {
        // Direct-partition readers never own group offsets.
        let consumer = create_consumer(
            &self.config,
            "kaftail-reader",
            false,
            self.token_provider.clone(),
        )?;
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, Offset::Offset(start))
            .map_err(|e| Error::Connection(format!("Failed to build assignment: {e}")))?;
        consumer
            .assign(&assignment)
            .map_err(|e| Error::Connection(format!("Failed to assign partition: {e}")))?;

        let range = self.offset_range(topic, partition).await?;
        Ok(Box::new(KafkaPartitionStream {
            consumer: Arc::new(consumer),
            topic: topic.to_string(),
            partition,
            high_water_mark: range.newest,
        }))
    }

    async fn group_stream(
        &self,
        topic: &str,
        group: &str,
        manual_commit: bool,
    ) -> Result<Box<dyn GroupStream>> {
        let consumer =
            create_consumer(&self.config, group, !manual_commit, self.token_provider.clone())?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| Error::Group(format!("Failed to subscribe to topic: {e}")))?;
        Ok(Box::new(KafkaGroupStream {
            consumer: Arc::new(consumer),
            topic: topic.to_string(),
        }))
    }
}

struct KafkaPartitionStream {
    consumer: Arc<EngineConsumer>,
    topic: String,
    partition: i32,
    high_water_mark: i64,
}

#[async_trait]
impl PartitionStream for KafkaPartitionStream {
    async fn next(&mut self) -> Result<Record> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::Connection(format!("Error receiving message: {e}")))?;
        let record = to_record(&msg);

        // Refresh the cached mark only when the reader has reached it, so the
        // caught-up check sees appends that happened after stream creation.
        if record.offset + 1 >= self.high_water_mark {
            let consumer = Arc::clone(&self.consumer);
            let topic = self.topic.clone();
            let partition = self.partition;
            let (_, newest) = tokio::task::spawn_blocking(move || {
                consumer.fetch_watermarks(&topic, partition, WATERMARK_TIMEOUT)
            })
            .await
            .map_err(|e| Error::Internal(format!("Watermark task failed: {e}")))?
            .map_err(|e| Error::Connection(format!("Failed to fetch watermarks: {e}")))?;
            self.high_water_mark = newest;
        }

        Ok(record)
    }

    fn high_water_mark(&self) -> i64 {
        self.high_water_mark
    }
}

struct KafkaGroupStream {
    consumer: Arc<EngineConsumer>,
    topic: String,
}

#[async_trait]
impl GroupStream for KafkaGroupStream {
    async fn next(&mut self) -> Result<Record> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::Group(format!("Error receiving message: {e}")))?;
        Ok(to_record(&msg))
    }

    async fn commit(&mut self, record: &Record) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &self.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )
        .map_err(|e| Error::Group(format!("Failed to add partition offset: {e}")))?;
        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
            .map_err(|e| Error::Group(format!("Failed to commit offset: {e}")))?;
        Ok(())
    }
}

fn to_record(msg: &rdkafka::message::BorrowedMessage<'_>) -> Record {
    let headers = msg
        .headers()
        .map(|hs| {
            hs.iter()
                .map(|h| {
                    (
                        h.key.to_string(),
                        Bytes::copy_from_slice(h.value.unwrap_or_default()),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    Record {
        key: msg.key().map(Bytes::copy_from_slice),
        value: msg.payload().map(Bytes::copy_from_slice),
        offset: msg.offset(),
        partition: msg.partition(),
        headers,
        timestamp: msg.timestamp().to_millis(),
    }
}


#[cfg(test)]
pub(crate) mod mock {
    //! In-memory broker used by the consume-path unit tests.

    use super::*;
    use std::collections::HashMap;

    pub(crate) fn record(partition: i32, offset: i64, value: &str) -> Record {
        Record {
            key: None,
            value: Some(Bytes::copy_from_slice(value.as_bytes())),
            offset,
            partition,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    #[derive(Default)]
    pub(crate) struct MockBroker {
        pub(crate) ranges: HashMap<i32, PartitionOffsets>,
        pub(crate) records: HashMap<i32, Vec<Record>>,
        /// Partitions whose stream creation fails
        pub(crate) broken: Vec<i32>,
        /// (partition, committed offset) pairs recorded by group streams
        pub(crate) committed: Arc<std::sync::Mutex<Vec<(i32, i64)>>>,
        /// `manual_commit` values passed to `group_stream`
        pub(crate) manual_commit_requests: Arc<std::sync::Mutex<Vec<bool>>>,
    }

    impl MockBroker {
        /// Partition with `records` appended starting at offset `oldest`.
        pub(crate) fn with_partition(mut self, partition: i32, oldest: i64, values: &[&str]) -> Self {
            let records: Vec<Record> = values
                .iter()
                .enumerate()
                .map(|(i, v)| record(partition, oldest + i as i64, v))
                .collect();
            let newest = oldest + records.len() as i64;
            self.ranges
                .insert(partition, PartitionOffsets { oldest, newest });
            self.records.insert(partition, records);
            self
        }
    }

    #[async_trait]
    impl BrokerConnection for MockBroker {
        async fn partitions(&self, _topic: &str) -> Result<Vec<i32>> {
            let mut ids: Vec<i32> = self.ranges.keys().copied().collect();
            ids.sort_unstable();
            Ok(ids)
        }

        async fn offset_range(&self, _topic: &str, partition: i32) -> Result<PartitionOffsets> {
            self.ranges
                .get(&partition)
                .copied()
                .ok_or_else(|| Error::Connection(format!("no such partition: {partition}")))
        }

        async fn partition_stream(
            &self,
            _topic: &str,
            partition: i32,
            start: i64,
        ) -> Result<Box<dyn PartitionStream>> {
            if self.broken.contains(&partition) {
                return Err(Error::Connection(format!(
                    "stream creation failed for partition {partition}"
                )));
            }
            let range = self.ranges[&partition];
            let pending: Vec<Record> = self.records[&partition]
                .iter()
                .filter(|r| r.offset >= start)
                .cloned()
                .collect();
            Ok(Box::new(MockStream {
                pending,
                high_water_mark: range.newest,
            }))
        }

        async fn group_stream(
            &self,
            _topic: &str,
            _group: &str,
            manual_commit: bool,
        ) -> Result<Box<dyn GroupStream>> {
            self.manual_commit_requests.lock().unwrap().push(manual_commit);
            let mut pending: Vec<Record> = self.records.values().flatten().cloned().collect();
            pending.sort_by_key(|r| (r.partition, r.offset));
            Ok(Box::new(MockGroupStream {
                pending,
                committed: Arc::clone(&self.committed),
            }))
        }
    }

    pub(crate) struct MockStream {
        pending: Vec<Record>,
        high_water_mark: i64,
    }

    #[async_trait]
    impl PartitionStream for MockStream {
        async fn next(&mut self) -> Result<Record> {
            if self.pending.is_empty() {
                // No more scripted records; block like a live stream would.
                futures::future::pending::<()>().await;
                unreachable!()
            }
            Ok(self.pending.remove(0))
        }

        fn high_water_mark(&self) -> i64 {
            self.high_water_mark
        }
    }

    pub(crate) struct MockGroupStream {
        pending: Vec<Record>,
        committed: Arc<std::sync::Mutex<Vec<(i32, i64)>>>,
    }

    #[async_trait]
    impl GroupStream for MockGroupStream {
        async fn next(&mut self) -> Result<Record> {
            if self.pending.is_empty() {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            Ok(self.pending.remove(0))
        }

        async fn commit(&mut self, record: &Record) -> Result<()> {
            self.committed
                .lock()
                .unwrap()
                .push((record.partition, record.offset + 1));
            Ok(())
        }
    }
}
