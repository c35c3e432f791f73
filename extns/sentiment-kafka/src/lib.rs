//! Kafka consumer for the sentiment pipeline. A single actor task owns the rdkafka
//! [`StreamConsumer`](rdkafka::consumer::StreamConsumer); callers talk to it through the cloneable
//! [`consumer::KafkaConsumer`] handle.

use std::fmt;
use std::str::FromStr;

pub mod consumer;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("Invalid offset reset policy - {0}")]
    OffsetReset(String),

    #[error("{0}")]
    Other(String),
}

/// What the consumer group does when it has no committed offset for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
    /// Fail the read instead of picking a position.
    None,
}

impl OffsetReset {
    /// Value understood by librdkafka's `auto.offset.reset`.
    pub fn as_librdkafka(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::None => "error",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            "none" | "error" => Ok(OffsetReset::None),
            other => Err(Error::OffsetReset(other.to_string())),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetReset::Earliest => write!(f, "earliest"),
            OffsetReset::Latest => write!(f, "latest"),
            OffsetReset::None => write!(f, "none"),
        }
    }
}
