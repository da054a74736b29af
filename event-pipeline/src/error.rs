use std::time::Duration;

use thiserror::Error;

/// A raw record that can never become a `NormalizedEvent`. Permanent: the record is
/// quarantined and acknowledged, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("required field '{0}' is missing")]
    MissingField(&'static str),
    #[error("required field '{0}' is empty")]
    EmptyField(&'static str),
    #[error("required field '{field}' has the wrong type, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("created_at {0} is not a valid unix timestamp")]
    InvalidTimestamp(i64),
    #[error("field '{field}' contains a path separator: {value}")]
    PathSeparator { field: &'static str, value: String },
}

impl ValidationError {
    /// Low cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::EmptyPayload => "empty_payload",
            ValidationError::MalformedJson(_) => "malformed_json",
            ValidationError::NotAnObject => "not_an_object",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::EmptyField(_) => "empty_field",
            ValidationError::WrongType { .. } => "wrong_type",
            ValidationError::InvalidTimestamp(_) => "invalid_timestamp",
            ValidationError::PathSeparator { .. } => "path_separator",
        }
    }
}

/// Failure talking to the dedup store. Always treated as transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),
    #[error("dedup store call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Failure writing a partition object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("object storage write failed: {0}")]
    Backend(String),
    #[error("object storage write timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to serialize event: {0}")]
    Serialize(String),
}

/// Missing or unusable configuration. Fatal: the process never starts consuming.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("failed to load configuration from environment: {0}")]
    Env(#[from] envconfig::Error),
    #[error("required setting {0} is empty")]
    Missing(&'static str),
    #[error("setting {name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Errors the retry loop knows how to classify.
pub trait RetryableError: std::fmt::Display {
    /// Whether another attempt could succeed.
    fn is_transient(&self) -> bool;

    /// Build the error reported when an attempt exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

impl RetryableError for StoreError {
    fn is_transient(&self) -> bool {
        true
    }

    fn timed_out(after: Duration) -> Self {
        StoreError::Timeout(after)
    }
}

impl RetryableError for WriteError {
    fn is_transient(&self) -> bool {
        !matches!(self, WriteError::Serialize(_))
    }

    fn timed_out(after: Duration) -> Self {
        WriteError::Timeout(after)
    }
}
