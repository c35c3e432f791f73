use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, OffsetReset, Result};

/// Timeout for the metadata and watermark lookups done on behalf of [`KafkaConsumer::pending`].
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConsumerConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic carrying the comment events.
    pub topic: String,
    /// The consumer group the processor joins.
    pub consumer_group: String,
    /// Only consulted when the group has no committed offset for a partition.
    pub offset_reset: OffsetReset,
    /// Group session timeout. The broker revokes our partitions when no heartbeat arrives within it.
    pub session_timeout: Duration,
    /// Longest gap between two reads before the member is dropped from the group. Has to cover
    /// the slowest batch, otherwise its commit is fenced and the batch is redelivered.
    pub max_poll_interval: Duration,
}

/// A record read from the comments topic.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    /// The topic name.
    pub topic: String,
    /// The user payload.
    pub value: Bytes,
    /// Key of the message
    pub key: Option<String>,
    /// The partition number.
    pub partition: i32,
    /// The offset of the message.
    pub offset: i64,
    /// The timestamp of the message in milliseconds since epoch.
    /// None if timestamp is not available.
    pub timestamp: Option<i64>,
}

/// Position of the last message of a partition that has been fully handled.
/// The consumer commits `offset + 1`, the position of the next message to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KafkaOffset {
    pub partition: i32,
    pub offset: i64,
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<i32> {
    tpl.elements().iter().map(|e| e.partition()).collect()
}

// Callbacks run by librdkafka on its own threads.
struct ConsumerLogContext;

impl ClientContext for ConsumerLogContext {}

impl ConsumerContext for ConsumerLogContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions = ?partitions_of(tpl), "Partitions revoked")
            }
            Rebalance::Assign(tpl) => {
                info!(partitions = ?partitions_of(tpl), "Partitions about to be assigned")
            }
            Rebalance::Error(e) => error!(?e, "Rebalance failed"),
        }
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            info!(partitions = ?partitions_of(tpl), "Partitions assigned");
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = ?partitions_of(offsets), "Committed offsets"),
            Err(e) => warn!(?e, "Offset commit reported an error"),
        }
    }
}

enum KafkaActorMessage {
    Read {
        respond_to: oneshot::Sender<Option<Result<Vec<KafkaMessage>>>>,
    },
    Commit {
        offsets: Vec<KafkaOffset>,
        respond_to: oneshot::Sender<Result<Vec<KafkaOffset>>>,
    },
    Pending {
        respond_to: oneshot::Sender<Result<Option<usize>>>,
    },
    Assignment {
        respond_to: oneshot::Sender<Result<Vec<i32>>>,
    },
}

type SentimentConsumer = StreamConsumer<ConsumerLogContext>;

struct KafkaActor {
    consumer: Arc<SentimentConsumer>,
    read_timeout: Duration,
    batch_size: usize,
    topic: String,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
    cancel_token: CancellationToken,
}

impl KafkaActor {
    async fn start(
        config: KafkaConsumerConfig,
        batch_size: usize,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                config.session_timeout.as_millis().to_string(),
            )
            .set(
                "max.poll.interval.ms",
                config.max_poll_interval.as_millis().to_string(),
            )
            .set("auto.offset.reset", config.offset_reset.as_librdkafka())
            .set("enable.auto.commit", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        let consumer: Arc<SentimentConsumer> = Arc::new(
            client_config
                .create_with_context(ConsumerLogContext)
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        // Subscribing to a topic that does not exist yet succeeds; reads start once it is created.
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        let mut actor = KafkaActor {
            consumer,
            read_timeout,
            batch_size,
            topic: config.topic,
            handler_rx,
            cancel_token,
        };

        // subscribe() does not talk to the brokers, a metadata round trip does.
        actor
            .pending_messages()
            .await
            .map_err(|err| Error::Kafka(format!("Failed to get pending messages: {err:?}")))?;

        tokio::spawn(async move {
            info!(topic = %actor.topic, "Starting Kafka consumer...");
            // terminates when every handle has been dropped
            actor.run().await;
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        match msg {
            KafkaActorMessage::Read { respond_to } => {
                let messages = self.read_messages().await;
                if respond_to.send(messages).is_err() {
                    warn!("Read requester went away before the batch was delivered");
                }
            }
            KafkaActorMessage::Commit {
                offsets,
                respond_to,
            } => {
                let status = self.commit_offsets(offsets).await;
                if respond_to.send(status).is_err() {
                    warn!("Commit requester went away before the commit finished");
                }
            }
            KafkaActorMessage::Pending { respond_to } => {
                let pending = self.pending_messages().await;
                if respond_to.send(pending).is_err() {
                    warn!("Pending requester went away");
                }
            }
            KafkaActorMessage::Assignment { respond_to } => {
                let assignment = self.assigned_partitions();
                if respond_to.send(assignment).is_err() {
                    warn!("Assignment requester went away");
                }
            }
        }
    }

    async fn read_messages(&mut self) -> Option<Result<Vec<KafkaMessage>>> {
        if self.cancel_token.is_cancelled() {
            return None;
        }

        let mut messages: Vec<KafkaMessage> = Vec::with_capacity(self.batch_size);
        let timeout = tokio::time::sleep(self.read_timeout);
        tokio::pin!(timeout);

        // A successful read resets the failure count.
        const MAX_FAILURE_COUNT: usize = 10;
        let mut continuous_failure_count = 0;
        while messages.len() < self.batch_size {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    break;
                }

                _ = &mut timeout => {
                    break;
                }

                message = self.consumer.recv() => {
                    let message = match message {
                        Ok(msg) => {
                            continuous_failure_count = 0;
                            msg
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                return Some(Err(Error::Kafka(format!(
                                    "Failed to read messages after {MAX_FAILURE_COUNT} retries: {e:?}"
                                ))));
                            }
                            error!(?e, "Failed to read messages, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    messages.push(KafkaMessage {
                        topic: message.topic().to_string(),
                        // a tombstone carries no payload
                        value: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
                        key: message.key().map(|k| String::from_utf8_lossy(k).to_string()),
                        partition: message.partition(),
                        offset: message.offset(),
                        timestamp: message.timestamp().to_millis(),
                    });
                }
            }
        }
        debug!(msg_count = messages.len(), "Read messages from Kafka");
        Some(Ok(messages))
    }

    /// Commits the highest offset per partition, skipping partitions this member no longer owns.
    /// Returns what was actually committed.
    async fn commit_offsets(&mut self, offsets: Vec<KafkaOffset>) -> Result<Vec<KafkaOffset>> {
        let mut highest: BTreeMap<i32, i64> = BTreeMap::new();
        for KafkaOffset { partition, offset } in offsets {
            highest
                .entry(partition)
                .and_modify(|current| *current = (*current).max(offset))
                .or_insert(offset);
        }
        if highest.is_empty() {
            return Ok(Vec::new());
        }

        let assigned = self.assigned_partitions()?;
        let (owned, revoked): (Vec<_>, Vec<_>) = highest
            .into_iter()
            .map(|(partition, offset)| KafkaOffset { partition, offset })
            .partition(|o| assigned.contains(&o.partition));
        if !revoked.is_empty() {
            warn!(
                partitions = ?revoked.iter().map(|o| o.partition).collect::<Vec<_>>(),
                "Dropping offsets of partitions no longer assigned"
            );
        }
        if owned.is_empty() {
            return Ok(owned);
        }

        let mut tpl = TopicPartitionList::new();
        for o in &owned {
            // Kafka expects the position of the next message to read.
            tpl.add_partition_offset(&self.topic, o.partition, Offset::Offset(o.offset + 1))
                .map_err(|e| {
                    Error::Kafka(format!("Failed to add partition offset for commit: {e}"))
                })?;
        }

        // a synchronous commit blocks on the coordinator round trip
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for commit task to complete: {e:?}")))??;

        Ok(owned)
    }

    fn assigned_partitions(&self) -> Result<Vec<i32>> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| Error::Kafka(format!("Failed to get partition assignment: {e}")))?;
        Ok(assignment
            .elements_for_topic(&self.topic)
            .iter()
            .map(|e| e.partition())
            .collect())
    }

    /// Sum of (high watermark - committed offset) over every partition of the topic.
    async fn pending_messages(&mut self) -> Result<Option<usize>> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();

        // metadata, committed offsets and watermarks are all blocking broker calls
        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(|e| Error::Kafka(format!("Failed to fetch metadata: {e}")))?;
            let Some(topic_metadata) = metadata.topics().first() else {
                warn!(topic, "No topic metadata found");
                return Ok(Some(0));
            };
            let mut pending = 0;
            for partition in topic_metadata.partitions().iter().map(|p| p.id()) {
                let mut tpl = TopicPartitionList::new();
                tpl.add_partition(&topic, partition);
                let committed = consumer
                    .committed_offsets(tpl, METADATA_TIMEOUT)
                    .map_err(|e| Error::Kafka(format!("Failed to get committed offsets: {e}")))?;
                let (low, high) = consumer
                    .fetch_watermarks(&topic, partition, METADATA_TIMEOUT)
                    .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))?;
                let committed_offset = match committed.elements_for_topic(&topic).first() {
                    Some(element) => match element.offset() {
                        Offset::Offset(offset) => offset,
                        _ => low,
                    },
                    None => low,
                };
                pending += (high - committed_offset).max(0) as usize;
            }
            Ok(Some(pending))
        })
        .await
        .map_err(|e| Error::Other(format!("Tokio task join error: {e}")))?
    }
}

/// Cloneable handle to the consumer actor.
#[derive(Clone)]
pub struct KafkaConsumer {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaConsumer {
    /// Creates the consumer, subscribes to the topic and checks the brokers are reachable.
    pub async fn connect(
        config: KafkaConsumerConfig,
        batch_size: usize,
        read_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(config, batch_size, read_timeout, rx, cancel_token).await?;
        Ok(Self { actor_tx: tx })
    }

    /// Reads up to `batch_size` messages, returning early after `read_timeout`.
    /// `None` once the cancellation token has fired.
    pub async fn read_messages(&self) -> Option<Result<Vec<KafkaMessage>>> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Read { respond_to: tx };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .unwrap_or_else(|_| Some(Err(Error::Other("Actor task terminated".into()))))
    }

    pub async fn commit(&self, offsets: Vec<KafkaOffset>) -> Result<Vec<KafkaOffset>> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Commit {
            offsets,
            respond_to: tx,
        };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn pending(&self) -> Result<Option<usize>> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Pending { respond_to: tx };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn assigned_partitions(&self) -> Result<Vec<i32>> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Assignment { respond_to: tx };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }
}

/// Helpers for tests that need a live broker on localhost:9092.
#[cfg(feature = "kafka-tests-utils")]
pub mod test_utils {
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::producer::{FutureProducer, FutureRecord};

    use super::*;

    pub async fn setup_test_topic(partitions: i32) -> (FutureProducer, String) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("Failed to create producer");

        let topic_name = format!(
            "sentiment_test_topic_{}",
            uuid::Uuid::new_v4().to_string().replace('-', "")
        );

        let admin_client = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create::<AdminClient<_>>()
            .expect("Failed to create admin client");

        let topic_config =
            NewTopic::new(topic_name.as_str(), partitions, TopicReplication::Fixed(1));
        admin_client
            .create_topics(&[topic_config], &AdminOptions::new())
            .await
            .expect("Failed to create topic");

        (producer, topic_name)
    }

    /// Produces `count` comment events to partition 0.
    pub async fn produce_comments(producer: &FutureProducer, topic: &str, count: usize) {
        for i in 0..count {
            let payload = format!(
                r#"{{"user_id": "user-{i}", "comment": "comment number {i}", "timestamp": "2024-05-01T10:00:00Z"}}"#
            );
            let key = format!("comment-{i}");
            let record = FutureRecord::to(topic)
                .payload(&payload)
                .key(&key)
                .partition(0);
            producer
                .send(record, Duration::from_secs(5))
                .await
                .expect("Failed to send message");
        }
    }
}
