//! In-memory stand-ins for the broker, the stores and the model, with error injection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sentiment_kafka::consumer::{KafkaMessage, KafkaOffset};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::archiver::RawStore;
use crate::message::{ProcessedRow, RawRecord, SentimentLabel};
use crate::processor::EventSource;
use crate::scorer::{Classifier, Prediction};
use crate::writer::ResultStore;

/// Decrements the counter and returns true if it was > 0.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub(crate) struct InMemoryRawStore {
    rows: Mutex<HashMap<String, RawRecord>>,
    put_calls: AtomicUsize,
    fail_next_puts: AtomicUsize,
    fail_next_tables: AtomicUsize,
    /// Rows that can never be written.
    failing_rows: Mutex<HashSet<String>>,
    /// Time every put takes before it answers.
    put_latency: Duration,
}

impl InMemoryRawStore {
    pub(crate) fn with_put_failures(self, count: usize) -> Self {
        self.fail_next_puts.store(count, Ordering::Relaxed);
        self
    }

    pub(crate) fn with_table_failures(self, count: usize) -> Self {
        self.fail_next_tables.store(count, Ordering::Relaxed);
        self
    }

    pub(crate) fn with_failing_row(self, row_key: &str) -> Self {
        self.failing_rows.lock().insert(row_key.to_string());
        self
    }

    pub(crate) fn with_put_latency(mut self, latency: Duration) -> Self {
        self.put_latency = latency;
        self
    }

    pub(crate) fn rows(&self) -> HashMap<String, RawRecord> {
        self.rows.lock().clone()
    }

    pub(crate) fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RawStore for InMemoryRawStore {
    async fn ensure_table(&self) -> crate::Result<()> {
        if take_failure(&self.fail_next_tables) {
            return Err(Error::StorageUnavailable("connection refused".into()));
        }
        Ok(())
    }

    async fn put(&self, record: &RawRecord) -> crate::Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if !self.put_latency.is_zero() {
            tokio::time::sleep(self.put_latency).await;
        }
        if take_failure(&self.fail_next_puts) || self.failing_rows.lock().contains(&record.row_key)
        {
            return Err(Error::StorageUnavailable("connection refused".into()));
        }
        self.rows
            .lock()
            .insert(record.row_key.clone(), record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct InMemoryResultStore {
    rows: Mutex<HashMap<String, ProcessedRow>>,
    upsert_calls: AtomicUsize,
    fail_next_upserts: AtomicUsize,
    reject_next_upserts: AtomicUsize,
    fail_next_schemas: AtomicUsize,
    rejected_ids: Mutex<HashSet<String>>,
}

impl InMemoryResultStore {
    pub(crate) fn with_upsert_failures(self, count: usize) -> Self {
        self.fail_next_upserts.store(count, Ordering::Relaxed);
        self
    }

    pub(crate) fn with_rejections(self, count: usize) -> Self {
        self.reject_next_upserts.store(count, Ordering::Relaxed);
        self
    }

    pub(crate) fn with_schema_failures(self, count: usize) -> Self {
        self.fail_next_schemas.store(count, Ordering::Relaxed);
        self
    }

    pub(crate) fn with_rejected_id(self, id: &str) -> Self {
        self.rejected_ids.lock().insert(id.to_string());
        self
    }

    pub(crate) fn rows(&self) -> HashMap<String, ProcessedRow> {
        self.rows.lock().clone()
    }

    pub(crate) fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn ensure_schema(&self) -> crate::Result<()> {
        if take_failure(&self.fail_next_schemas) {
            return Err(Error::StorageUnavailable("connection refused".into()));
        }
        Ok(())
    }

    async fn upsert(&self, row: &ProcessedRow) -> crate::Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_next_upserts) {
            return Err(Error::StorageUnavailable("connection refused".into()));
        }
        if take_failure(&self.reject_next_upserts) || self.rejected_ids.lock().contains(&row.id) {
            return Err(Error::ConstraintViolation(format!(
                "Data too long for column 'id' ({})",
                row.id
            )));
        }
        self.rows.lock().insert(row.id.clone(), row.clone());
        Ok(())
    }
}

/// Answers `neutral 0.5` unless a prediction was registered for the exact text.
#[derive(Default)]
pub(crate) struct FakeClassifier {
    predictions: HashMap<String, Prediction>,
    inputs: Mutex<Vec<String>>,
    fail_next: AtomicUsize,
    /// Text that makes the classifier panic.
    panic_on: Option<String>,
}

impl FakeClassifier {
    pub(crate) fn with_prediction(
        mut self,
        text: &str,
        label: SentimentLabel,
        confidence: f64,
    ) -> Self {
        self.predictions
            .insert(text.to_string(), Prediction { label, confidence });
        self
    }

    pub(crate) fn with_failures(self, count: usize) -> Self {
        self.fail_next.store(count, Ordering::Relaxed);
        self
    }

    pub(crate) fn with_panic_on(mut self, text: &str) -> Self {
        self.panic_on = Some(text.to_string());
        self
    }

    /// Every text the classifier was called with, in order.
    pub(crate) fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, text: &str) -> crate::Result<Prediction> {
        self.inputs.lock().push(text.to_string());
        if self.panic_on.as_deref() == Some(text) {
            panic!("classifier crashed on {text:?}");
        }
        if take_failure(&self.fail_next) {
            return Err(Error::ModelUnavailable("model is loading".into()));
        }
        Ok(self
            .predictions
            .get(text)
            .copied()
            .unwrap_or(Prediction {
                label: SentimentLabel::Neutral,
                confidence: 0.5,
            }))
    }
}

/// Hands out the queued batches, then reports the source as closed.
#[derive(Clone, Default)]
pub(crate) struct FakeEventSource {
    batches: Arc<Mutex<VecDeque<Vec<KafkaMessage>>>>,
    commits: Arc<Mutex<Vec<Vec<KafkaOffset>>>>,
    /// When set, only these partitions are considered assigned at commit time.
    assigned: Option<Vec<i32>>,
    fail_next_commits: Arc<AtomicUsize>,
    /// Cancelled right after the n-th batch has been handed out.
    cancel_after: Option<(usize, CancellationToken)>,
    reads: Arc<AtomicUsize>,
    /// Commits are refused once more than this has passed since the last read, the way a group
    /// coordinator fences a member that stopped polling.
    max_poll_interval: Option<Duration>,
    last_read: Arc<Mutex<Option<Instant>>>,
}

impl FakeEventSource {
    pub(crate) fn new(batches: Vec<Vec<KafkaMessage>>) -> Self {
        Self {
            batches: Arc::new(Mutex::new(batches.into())),
            ..Default::default()
        }
    }

    pub(crate) fn with_assigned(mut self, partitions: Vec<i32>) -> Self {
        self.assigned = Some(partitions);
        self
    }

    pub(crate) fn with_commit_failures(self, count: usize) -> Self {
        self.fail_next_commits.store(count, Ordering::Relaxed);
        self
    }

    pub(crate) fn cancel_after(mut self, reads: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((reads, token));
        self
    }

    pub(crate) fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = Some(interval);
        self
    }

    /// Successful commits, one entry per commit call.
    pub(crate) fn commits(&self) -> Vec<Vec<KafkaOffset>> {
        self.commits.lock().clone()
    }

    /// Highest committed offset of a partition, if any.
    pub(crate) fn committed(&self, partition: i32) -> Option<i64> {
        self.commits
            .lock()
            .iter()
            .flatten()
            .filter(|o| o.partition == partition)
            .map(|o| o.offset)
            .max()
    }
}

impl EventSource for FakeEventSource {
    async fn read(&mut self) -> Option<crate::Result<Vec<KafkaMessage>>> {
        let batch = self.batches.lock().pop_front()?;
        *self.last_read.lock() = Some(Instant::now());
        let reads = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if reads >= *after {
                token.cancel();
            }
        }
        Some(Ok(batch))
    }

    async fn commit(&mut self, offsets: Vec<KafkaOffset>) -> crate::Result<Vec<KafkaOffset>> {
        if take_failure(&self.fail_next_commits) {
            return Err(Error::Broker("Failed to commit offsets: coordinator moved".into()));
        }
        if let (Some(limit), Some(last_read)) = (self.max_poll_interval, *self.last_read.lock()) {
            if last_read.elapsed() > limit {
                return Err(Error::Broker(
                    "Failed to commit offsets: member left the group, poll interval exceeded".into(),
                ));
            }
        }
        let offsets: Vec<KafkaOffset> = match &self.assigned {
            Some(assigned) => offsets
                .into_iter()
                .filter(|o| assigned.contains(&o.partition))
                .collect(),
            None => offsets,
        };
        self.commits.lock().push(offsets.clone());
        Ok(offsets)
    }
}
