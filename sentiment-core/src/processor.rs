//! The stream processor pulls a batch from the broker, runs every event through
//! archive -> score -> write, and commits what reached a terminal outcome.
//!
//! Events of one partition are handled sequentially in offset order by a single worker task;
//! partitions of the same batch are handled concurrently. An event that fails for good is
//! dead-lettered (logged, counted, skipped) so it never holds back the events after it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sentiment_kafka::consumer::{KafkaConsumer, KafkaMessage, KafkaOffset};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::archiver::Archiver;
use crate::error::Failure;
use crate::message::Event;
use crate::metrics::PipelineMetrics;
use crate::scorer::Scorer;
use crate::writer::ResultWriter;

/// Source of event batches with offset commits.
#[trait_variant::make(EventSource: Send)]
#[allow(dead_code)]
pub trait LocalEventSource {
    /// Next batch, possibly empty. `None` once the source is shut down.
    async fn read(&mut self) -> Option<Result<Vec<KafkaMessage>>>;

    /// Commits the given offsets, returns the ones actually committed.
    async fn commit(&mut self, offsets: Vec<KafkaOffset>) -> Result<Vec<KafkaOffset>>;
}

impl EventSource for KafkaConsumer {
    async fn read(&mut self) -> Option<Result<Vec<KafkaMessage>>> {
        self.read_messages()
            .await
            .map(|batch| batch.map_err(Into::into))
    }

    async fn commit(&mut self, offsets: Vec<KafkaOffset>) -> Result<Vec<KafkaOffset>> {
        Ok(KafkaConsumer::commit(self, offsets).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Polling,
    Processing,
    Committing,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Decode,
    Archive,
    Score,
    Write,
    /// The partition worker itself died.
    Worker,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Archive => "archive",
            Stage::Score => "score",
            Stage::Write => "write",
            Stage::Worker => "worker",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Stored,
    DeadLettered,
}

/// What a partition worker got through before it stopped.
#[derive(Debug, Default)]
struct PartitionProgress {
    /// Last event that reached a terminal outcome. Every event before it did too.
    last: Option<KafkaOffset>,
    stored: usize,
    dead_lettered: usize,
}

/// The per-event stages. Cheap to clone, every component is shared.
#[derive(Clone)]
pub struct Pipeline {
    archiver: Archiver,
    scorer: Scorer,
    writer: ResultWriter,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        archiver: Archiver,
        scorer: Scorer,
        writer: ResultWriter,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            archiver,
            scorer,
            writer,
            metrics,
        }
    }

    async fn handle(&self, message: &KafkaMessage) -> Outcome {
        let event = match Event::try_from(message) {
            Ok(event) => event,
            Err(e) => {
                self.dead_letter(None, message, Stage::Decode, &Failure::once(e));
                return Outcome::DeadLettered;
            }
        };
        let labels = self.metrics.common_labels();

        let start = Instant::now();
        let archived = self.archiver.archive(&event).await;
        self.metrics
            .archive_time
            .get_or_create(labels)
            .observe(start.elapsed().as_micros() as f64);
        if let Err(failure) = archived {
            self.dead_letter(Some(&event.id), message, Stage::Archive, &failure);
            return Outcome::DeadLettered;
        }

        let start = Instant::now();
        let scored = self.scorer.score(&event.id, &event.text).await;
        self.metrics
            .score_time
            .get_or_create(labels)
            .observe(start.elapsed().as_micros() as f64);
        let result = match scored {
            Ok(result) => result,
            Err(failure) => {
                self.dead_letter(Some(&event.id), message, Stage::Score, &failure);
                return Outcome::DeadLettered;
            }
        };

        let start = Instant::now();
        let written = self.writer.upsert(&result, &event).await;
        self.metrics
            .write_time
            .get_or_create(labels)
            .observe(start.elapsed().as_micros() as f64);
        if let Err(failure) = written {
            self.dead_letter(Some(&event.id), message, Stage::Write, &failure);
            return Outcome::DeadLettered;
        }

        self.metrics.processed_total.get_or_create(labels).inc();
        Outcome::Stored
    }

    fn dead_letter(
        &self,
        event_id: Option<&str>,
        message: &KafkaMessage,
        stage: Stage,
        failure: &Failure,
    ) {
        warn!(
            event_id = event_id.unwrap_or("unknown"),
            partition = message.partition,
            offset = message.offset,
            %stage,
            error_kind = failure.error.kind(),
            attempts = failure.attempts,
            error = %failure.error,
            "Dead-lettering event"
        );
        self.metrics
            .dead_lettered(stage.as_str(), failure.error.kind(), 1);
    }

    /// Handles the messages of one partition in order. Stops before the next message once
    /// `cancel` fires, the in-flight one is always finished.
    async fn process_partition(
        self,
        messages: Vec<KafkaMessage>,
        cancel: CancellationToken,
    ) -> PartitionProgress {
        let mut progress = PartitionProgress::default();
        for message in messages {
            if cancel.is_cancelled() {
                debug!(
                    partition = message.partition,
                    offset = message.offset,
                    "Shutting down, leaving the rest of the partition for redelivery"
                );
                break;
            }
            match self.handle(&message).await {
                Outcome::Stored => progress.stored += 1,
                Outcome::DeadLettered => progress.dead_lettered += 1,
            }
            progress.last = Some(KafkaOffset {
                partition: message.partition,
                offset: message.offset,
            });
        }
        progress
    }
}

/// Groups a batch by partition, each partition sorted by offset.
fn by_partition(messages: Vec<KafkaMessage>) -> BTreeMap<i32, Vec<KafkaMessage>> {
    let mut partitions: BTreeMap<i32, Vec<KafkaMessage>> = BTreeMap::new();
    for message in messages {
        partitions
            .entry(message.partition)
            .or_default()
            .push(message);
    }
    for messages in partitions.values_mut() {
        messages.sort_by_key(|m| m.offset);
    }
    partitions
}

pub struct Processor<S> {
    source: S,
    pipeline: Pipeline,
    cancel: CancellationToken,
    state: ProcessorState,
}

impl<S: EventSource> Processor<S> {
    pub fn new(source: S, pipeline: Pipeline, cancel: CancellationToken) -> Self {
        Self {
            source,
            pipeline,
            cancel,
            state: ProcessorState::Idle,
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Runs the poll/process/commit loop until `cancel` fires or the source closes.
    /// A batch is always completely processed (or drained) and committed before the loop
    /// looks at the token again. Only a broker read error ends the loop with an error.
    pub async fn start(&mut self) -> Result<()> {
        let mut processed_count: usize = 0;
        let mut last_logged_at = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.state = ProcessorState::Polling;
            let Some(batch) = self.source.read().await else {
                break;
            };
            let batch = batch.inspect_err(|e| error!(?e, "Reading from the broker"))?;

            let start = Instant::now();
            processed_count += self.process_batch(batch).await;
            if processed_count > 0 {
                self.pipeline
                    .metrics
                    .batch_time
                    .get_or_create(self.pipeline.metrics.common_labels())
                    .observe(start.elapsed().as_micros() as f64);
            }

            if last_logged_at.elapsed().as_millis() >= 1000 {
                info!(
                    "Processed {} events at time {}",
                    processed_count,
                    Utc::now()
                );
                processed_count = 0;
                last_logged_at = Instant::now();
            }
        }

        self.state = ProcessorState::Draining;
        info!("Processor stopped");
        Ok(())
    }

    /// Processes the batch, commits, and returns how many events reached a terminal outcome.
    async fn process_batch(&mut self, batch: Vec<KafkaMessage>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let metrics = Arc::clone(&self.pipeline.metrics);
        metrics
            .read_total
            .get_or_create(metrics.common_labels())
            .inc_by(batch.len() as u64);

        self.state = ProcessorState::Processing;
        let mut workers = JoinSet::new();
        let mut partitions = HashMap::new();
        for (partition, messages) in by_partition(batch) {
            let pipeline = self.pipeline.clone();
            let cancel = self.cancel.clone();
            let count = messages.len();
            debug!(partition, count, "Starting partition worker");
            let handle = workers.spawn(pipeline.process_partition(messages, cancel));
            partitions.insert(handle.id(), (partition, count));
        }

        let mut offsets = Vec::new();
        let mut handled = 0;
        while let Some(joined) = workers.join_next_with_id().await {
            match joined {
                Ok((_, progress)) => {
                    handled += progress.stored + progress.dead_lettered;
                    if progress.dead_lettered > 0 {
                        debug!(
                            stored = progress.stored,
                            dead_lettered = progress.dead_lettered,
                            "Partition finished with dead-lettered events"
                        );
                    }
                    offsets.extend(progress.last);
                }
                // later batches commit past these events, so they count as dead letters
                Err(e) => {
                    let (partition, count) = partitions.get(&e.id()).copied().unwrap_or_default();
                    error!(?e, partition, count, "Partition worker failed, skipping its events");
                    let kind = if e.is_panic() { "panic" } else { "cancelled" };
                    metrics.dead_lettered(Stage::Worker.as_str(), kind, count as u64);
                    handled += count;
                }
            }
        }

        if self.cancel.is_cancelled() {
            self.state = ProcessorState::Draining;
        }
        if !offsets.is_empty() {
            if self.state != ProcessorState::Draining {
                self.state = ProcessorState::Committing;
            }
            self.commit(offsets).await;
        }
        handled
    }

    /// Commit failures are not fatal: the events are redelivered and rewritten under the
    /// same ids.
    async fn commit(&mut self, offsets: Vec<KafkaOffset>) {
        let metrics = &self.pipeline.metrics;
        match self.source.commit(offsets).await {
            Ok(committed) => {
                metrics.committed(true);
                debug!(?committed, "Committed offsets");
            }
            Err(e) => {
                metrics.committed(false);
                warn!(?e, "Failed to commit offsets, events will be redelivered");
            }
        }
    }
}
