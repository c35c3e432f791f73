use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Failure};
use crate::message::{Event, ProcessedRow, SentimentResult};
use crate::retry::RetryExecutor;

pub mod mysql;

/// Relational store holding one row per scored event.
///
/// This trait is object-safe and can be used as `Arc<dyn ResultStore>`.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Creates the results table when it does not exist yet.
    async fn ensure_schema(&self) -> crate::Result<()>;

    /// Inserts the row, or replaces the row with the same id.
    async fn upsert(&self, row: &ProcessedRow) -> crate::Result<()>;
}

#[derive(Clone)]
pub struct ResultWriter {
    store: Arc<dyn ResultStore>,
    retry: RetryExecutor,
}

impl ResultWriter {
    pub fn new(store: Arc<dyn ResultStore>, retry: RetryExecutor) -> Self {
        Self { store, retry }
    }

    pub async fn ensure_schema(&self) -> Result<(), Failure> {
        self.retry.execute(|| self.store.ensure_schema()).await
    }

    pub async fn upsert(&self, result: &SentimentResult, event: &Event) -> Result<(), Failure> {
        if !(0.0..=1.0).contains(&result.confidence) {
            return Err(Failure::once(Error::ConstraintViolation(format!(
                "confidence {} of {} outside [0, 1]",
                result.confidence, result.event_id
            ))));
        }
        if result.event_id != event.id {
            return Err(Failure::once(Error::ConstraintViolation(format!(
                "result for {} paired with event {}",
                result.event_id, event.id
            ))));
        }

        let row = ProcessedRow::new(result, event);
        self.retry.execute(|| self.store.upsert(&row)).await?;
        debug!(event_id = %row.id, label = %row.sentiment_prediction, "Stored sentiment result");
        Ok(())
    }
}
