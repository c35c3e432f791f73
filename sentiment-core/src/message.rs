use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sentiment_kafka::consumer::KafkaMessage;
use serde::Deserialize;
use uuid::Uuid;

use crate::Error;
use crate::Result;

/// A comment event read from the broker. Immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_channel: String,
    pub author: Option<String>,
    pub text: String,
    pub partition: i32,
    pub offset: i64,
    /// The bytes exactly as read from the broker.
    pub payload: Bytes,
}

/// A JSON scalar that may arrive either as a string or as a number.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(s) => write!(f, "{s}"),
            Scalar::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Both payload shapes are accepted: `{user_id, comment, timestamp}` from the chat poller and
/// `{id, author, text, source_channel, timestamp}`.
#[derive(Deserialize, Debug)]
struct CommentPayload {
    id: Option<Scalar>,
    author: Option<String>,
    user_id: Option<Scalar>,
    text: Option<String>,
    comment: Option<String>,
    source_channel: Option<String>,
    timestamp: Option<Scalar>,
}

fn parse_timestamp(value: &Scalar) -> Option<DateTime<Utc>> {
    match value {
        Scalar::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Scalar::Text(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            s.parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        }
    }
}

impl TryFrom<&KafkaMessage> for Event {
    type Error = Error;

    fn try_from(message: &KafkaMessage) -> Result<Self> {
        let payload: CommentPayload = serde_json::from_slice(&message.value).map_err(|e| {
            Error::InvalidRecord(format!(
                "undecodable payload at {}/{}: {e}",
                message.partition, message.offset
            ))
        })?;

        let text = payload.text.or(payload.comment).ok_or_else(|| {
            Error::InvalidRecord(format!(
                "payload at {}/{} carries neither 'text' nor 'comment'",
                message.partition, message.offset
            ))
        })?;

        // an explicit id wins, even a blank one, which the archiver refuses
        let id = match payload.id {
            Some(id) => id.to_string(),
            None => match message.key.as_deref().map(str::trim) {
                Some(key) if !key.is_empty() => key.to_string(),
                _ => Uuid::new_v5(
                    &Uuid::NAMESPACE_OID,
                    format!("{}/{}/{}", message.topic, message.partition, message.offset)
                        .as_bytes(),
                )
                .to_string(),
            },
        };

        let timestamp = payload
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .or_else(|| {
                message
                    .timestamp
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            })
            // the epoch keeps rewrites of the same message identical
            .unwrap_or_default();

        Ok(Event {
            id,
            timestamp,
            source_channel: payload
                .source_channel
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| message.topic.clone()),
            author: payload
                .author
                .or_else(|| payload.user_id.map(|u| u.to_string())),
            text,
            partition: message.partition,
            offset: message.offset,
            payload: message.value.clone(),
        })
    }
}

/// The classes of the multilingual sentiment model, most negative first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentimentLabel {
    VeryNegative,
    Negative,
    Neutral,
    Positive,
    VeryPositive,
}

impl SentimentLabel {
    pub const ALL: [SentimentLabel; 5] = [
        SentimentLabel::VeryNegative,
        SentimentLabel::Negative,
        SentimentLabel::Neutral,
        SentimentLabel::Positive,
        SentimentLabel::VeryPositive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::VeryNegative => "very_negative",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Positive => "positive",
            SentimentLabel::VeryPositive => "very_positive",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the model's own spellings ("Very Negative", "very-positive") and the bare class
/// index form `LABEL_0` .. `LABEL_4`.
impl FromStr for SentimentLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        if let Some(index) = normalized.strip_prefix("label_") {
            return index
                .parse::<usize>()
                .ok()
                .and_then(|i| Self::ALL.get(i).copied())
                .ok_or_else(|| Error::Scoring(format!("unknown label '{s}'")));
        }
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == normalized)
            .ok_or_else(|| Error::Scoring(format!("unknown label '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentimentResult {
    pub event_id: String,
    pub label: SentimentLabel,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub model_name: String,
    pub scored_at: DateTime<Utc>,
}

/// Verbatim copy of an event as stored in the wide-column store.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub row_key: String,
    pub column_family: String,
    pub columns: BTreeMap<String, Bytes>,
    /// Cell version; the event time, so re-writing the same event yields the same cells.
    pub written_at: i64,
}

impl RawRecord {
    pub fn from_event(event: &Event, column_family: &str) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert("payload".to_string(), event.payload.clone());
        if let Some(author) = &event.author {
            columns.insert("user_id".to_string(), Bytes::from(author.clone()));
        }
        columns.insert("comment".to_string(), Bytes::from(event.text.clone()));
        columns.insert(
            "source_channel".to_string(),
            Bytes::from(event.source_channel.clone()),
        );
        columns.insert(
            "event_time".to_string(),
            Bytes::from(event.timestamp.to_rfc3339()),
        );
        columns.insert(
            "partition".to_string(),
            Bytes::from(event.partition.to_string()),
        );
        columns.insert("offset".to_string(), Bytes::from(event.offset.to_string()));

        RawRecord {
            row_key: event.id.clone(),
            column_family: column_family.to_string(),
            columns,
            written_at: event.timestamp.timestamp_millis(),
        }
    }
}

/// A row of the relational `comments` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRow {
    pub id: String,
    pub user_id: Option<String>,
    pub comment: String,
    pub source_channel: String,
    pub timestamp: DateTime<Utc>,
    pub sentiment_prediction: String,
    pub confidence: f64,
    pub model_name: String,
}

impl ProcessedRow {
    pub fn new(result: &SentimentResult, event: &Event) -> Self {
        ProcessedRow {
            id: result.event_id.clone(),
            user_id: event.author.clone(),
            comment: event.text.clone(),
            source_channel: event.source_channel.clone(),
            timestamp: event.timestamp,
            sentiment_prediction: result.label.to_string(),
            confidence: result.confidence,
            model_name: result.model_name.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn kafka_message(partition: i32, offset: i64, payload: &str) -> KafkaMessage {
    KafkaMessage {
        topic: "comments".to_string(),
        value: Bytes::from(payload.to_string()),
        key: None,
        partition,
        offset,
        timestamp: Some(1_714_557_600_000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chat_poller_shape() {
        let message = kafka_message(
            0,
            7,
            r#"{"user_id": "UC123", "comment": "I love this!", "timestamp": "2024-05-01T10:00:00Z"}"#,
        );
        let event = Event::try_from(&message).unwrap();
        assert_eq!(event.author.as_deref(), Some("UC123"));
        assert_eq!(event.text, "I love this!");
        assert_eq!(event.source_channel, "comments");
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!((event.partition, event.offset), (0, 7));
        assert_eq!(event.payload, message.value);
    }

    #[test]
    fn decodes_full_shape() {
        let message = kafka_message(
            1,
            3,
            r#"{"id": "c-1", "author": "ana", "text": "meh", "source_channel": "yt-live", "timestamp": 1714557600123}"#,
        );
        let event = Event::try_from(&message).unwrap();
        assert_eq!(event.id, "c-1");
        assert_eq!(event.source_channel, "yt-live");
        assert_eq!(event.timestamp.timestamp_millis(), 1_714_557_600_123);
    }

    #[test]
    fn id_falls_back_to_key_then_coordinates() {
        let mut message = kafka_message(2, 40, r#"{"comment": "hello"}"#);
        message.key = Some("yt-msg-9".to_string());
        assert_eq!(Event::try_from(&message).unwrap().id, "yt-msg-9");

        message.key = None;
        let first = Event::try_from(&message).unwrap();
        let again = Event::try_from(&message).unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.timestamp.timestamp_millis(), 1_714_557_600_000);

        let other = Event::try_from(&kafka_message(2, 41, r#"{"comment": "hello"}"#)).unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn blank_id_is_kept_for_the_archiver_to_refuse() {
        let message = kafka_message(0, 0, r#"{"id": "  ", "text": "x"}"#);
        assert_eq!(Event::try_from(&message).unwrap().id, "  ");
    }

    #[test]
    fn undecodable_payloads_are_invalid_records() {
        for payload in ["not json", "[1, 2]", r#"{"user_id": "u"}"#] {
            let result = Event::try_from(&kafka_message(0, 0, payload));
            assert!(
                matches!(result, Err(Error::InvalidRecord(_))),
                "{payload} -> {result:?}"
            );
        }
    }

    #[test]
    fn label_spellings() {
        assert_eq!(
            "Very Positive".parse::<SentimentLabel>().unwrap(),
            SentimentLabel::VeryPositive
        );
        assert_eq!(
            "NEGATIVE".parse::<SentimentLabel>().unwrap(),
            SentimentLabel::Negative
        );
        assert_eq!(
            "LABEL_0".parse::<SentimentLabel>().unwrap(),
            SentimentLabel::VeryNegative
        );
        assert_eq!(
            "label_4".parse::<SentimentLabel>().unwrap(),
            SentimentLabel::VeryPositive
        );
        assert!(matches!(
            "LABEL_5".parse::<SentimentLabel>(),
            Err(Error::Scoring(_))
        ));
        assert!(matches!(
            "ecstatic".parse::<SentimentLabel>(),
            Err(Error::Scoring(_))
        ));
    }

    #[test]
    fn raw_record_is_stable_across_rewrites() {
        let event = Event::try_from(&kafka_message(
            0,
            5,
            r#"{"id": "c-5", "user_id": "u", "comment": "ok", "timestamp": "2024-05-01T10:00:00Z"}"#,
        ))
        .unwrap();
        let record = RawRecord::from_event(&event, "data");
        assert_eq!(record, RawRecord::from_event(&event, "data"));
        assert_eq!(record.row_key, "c-5");
        assert_eq!(record.written_at, event.timestamp.timestamp_millis());
        assert_eq!(record.columns["comment"], Bytes::from("ok"));
        assert_eq!(record.columns["payload"], event.payload);
        assert_eq!(record.columns["offset"], Bytes::from("5"));
    }

    #[test]
    fn missing_timestamps_fall_back_to_the_epoch() {
        let mut message = kafka_message(2, 9, r#"{"id": "c-9", "comment": "no clock"}"#);
        message.timestamp = None;

        let first = RawRecord::from_event(&Event::try_from(&message).unwrap(), "data");
        let second = RawRecord::from_event(&Event::try_from(&message).unwrap(), "data");

        assert_eq!(first, second);
        assert_eq!(first.written_at, 0);
        assert_eq!(first.columns["event_time"], second.columns["event_time"]);
    }
}
