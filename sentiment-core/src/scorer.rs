use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{Error, Failure};
use crate::message::{SentimentLabel, SentimentResult};
use crate::retry::RetryExecutor;

pub mod http;

/// Most likely class for a piece of text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: SentimentLabel,
    pub confidence: f64,
}

/// Text-classification backend.
///
/// This trait is object-safe and can be used as `Arc<dyn Classifier>`.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> crate::Result<Prediction>;
}

/// Longest prefix of `text` with at most `max_chars` characters.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Clone)]
pub struct Scorer {
    classifier: Arc<dyn Classifier>,
    model_name: String,
    max_length: usize,
    retry: RetryExecutor,
}

impl Scorer {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        model_name: String,
        max_length: usize,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            classifier,
            model_name,
            max_length,
            retry,
        }
    }

    pub async fn score(&self, event_id: &str, text: &str) -> Result<SentimentResult, Failure> {
        let text = truncate_chars(text, self.max_length);
        if text.trim().is_empty() {
            return Ok(self.result(event_id, SentimentLabel::Neutral, 0.0));
        }

        let prediction = self.retry.execute(|| self.classifier.classify(text)).await?;
        if !(0.0..=1.0).contains(&prediction.confidence) {
            return Err(Failure::once(Error::Scoring(format!(
                "confidence {} outside [0, 1]",
                prediction.confidence
            ))));
        }
        debug!(
            event_id,
            label = %prediction.label,
            confidence = prediction.confidence,
            "Scored event"
        );
        Ok(self.result(event_id, prediction.label, prediction.confidence))
    }

    fn result(&self, event_id: &str, label: SentimentLabel, confidence: f64) -> SentimentResult {
        SentimentResult {
            event_id: event_id.to_string(),
            label,
            confidence,
            model_name: self.model_name.clone(),
            scored_at: Utc::now(),
        }
    }
}
