use std::fmt;

use backoff::RetryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Broker Error - {0}")]
    Broker(String),

    /// The durable or relational store could not be reached, or answered with a transient error.
    #[error("Storage Unavailable - {0}")]
    StorageUnavailable(String),

    /// The classification backend could not be reached, timed out, or is still loading the model.
    #[error("Model Unavailable - {0}")]
    ModelUnavailable(String),

    #[error("Invalid Record - {0}")]
    InvalidRecord(String),

    /// The backend answered, but with something that is not a usable prediction.
    #[error("Scoring Error - {0}")]
    Scoring(String),

    #[error("Constraint Violation - {0}")]
    ConstraintViolation(String),

    #[error("Startup Error - {0}")]
    Startup(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt after a backoff delay.
    Retryable,
    /// The event is dead-lettered and the pipeline moves on.
    TerminalPerEvent,
    /// The process cannot continue.
    FatalProcess,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::StorageUnavailable(_) | Error::ModelUnavailable(_) => ErrorClass::Retryable,
            Error::InvalidRecord(_) | Error::Scoring(_) | Error::ConstraintViolation(_) => {
                ErrorClass::TerminalPerEvent
            }
            Error::Config(_) | Error::Broker(_) | Error::Startup(_) | Error::Metrics(_) => {
                ErrorClass::FatalProcess
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Short stable name, used as a metric label and a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Broker(_) => "broker",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::ModelUnavailable(_) => "model_unavailable",
            Error::InvalidRecord(_) => "invalid_record",
            Error::Scoring(_) => "scoring",
            Error::ConstraintViolation(_) => "constraint_violation",
            Error::Startup(_) => "startup",
            Error::Metrics(_) => "metrics",
        }
    }
}

impl From<sentiment_kafka::Error> for Error {
    fn from(value: sentiment_kafka::Error) -> Self {
        Error::Broker(value.to_string())
    }
}

/// The outcome of an operation that went through the retry executor and still failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// The last error seen.
    pub error: Error,
    /// How many times the operation was invoked, the first call included.
    pub attempts: u32,
}

impl Failure {
    /// A failure that was never retried.
    pub fn once(error: Error) -> Self {
        Self { error, attempts: 1 }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (attempts: {})", self.error, self.attempts)
    }
}

impl std::error::Error for Failure {}

impl From<RetryError<Error>> for Failure {
    fn from(value: RetryError<Error>) -> Self {
        let attempts = value.attempts();
        Failure {
            error: value.into_inner(),
            attempts,
        }
    }
}

impl From<Failure> for Error {
    fn from(value: Failure) -> Self {
        value.error
    }
}
