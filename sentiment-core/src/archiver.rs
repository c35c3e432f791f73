//! Archives every consumed event, verbatim, into the wide-column store before it is scored.
//! Rows are keyed by event id and versioned by event time, so archiving the same event twice
//! leaves the store unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Failure};
use crate::message::{Event, RawRecord};
use crate::retry::RetryExecutor;

pub mod hbase;

/// Durable key-value store holding the raw events.
///
/// This trait is object-safe and can be used as `Arc<dyn RawStore>`.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Creates the table and its column family when they do not exist yet.
    async fn ensure_table(&self) -> crate::Result<()>;

    /// Writes all cells of the record. Writing the same record again is a no-op.
    async fn put(&self, record: &RawRecord) -> crate::Result<()>;
}

#[derive(Clone)]
pub struct Archiver {
    store: Arc<dyn RawStore>,
    column_family: String,
    retry: RetryExecutor,
}

impl Archiver {
    pub fn new(store: Arc<dyn RawStore>, column_family: String, retry: RetryExecutor) -> Self {
        Self {
            store,
            column_family,
            retry,
        }
    }

    /// Startup schema setup, retried like any other write.
    pub async fn ensure_schema(&self) -> Result<(), Failure> {
        self.retry.execute(|| self.store.ensure_table()).await
    }

    pub async fn archive(&self, event: &Event) -> Result<(), Failure> {
        if event.id.trim().is_empty() {
            return Err(Failure::once(Error::InvalidRecord(format!(
                "event at {}/{} has a blank id",
                event.partition, event.offset
            ))));
        }

        let start = Instant::now();
        let record = RawRecord::from_event(event, &self.column_family);
        self.retry.execute(|| self.store.put(&record)).await?;
        debug!(
            event_id = %event.id,
            latency_ms = start.elapsed().as_millis() as u64,
            "Archived raw event"
        );
        Ok(())
    }
}
