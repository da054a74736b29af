//! Event normalization.
//!
//! Raw events are opaque JSON objects: only `event_uuid`, `event_name` and
//! `created_at` are typed, everything else is carried through untouched. The
//! normalizer validates that subset and derives `event_type`, `event_subtype` and
//! `created_datetime` from it. It never looks at anything outside the payload, so the
//! same input always produces the same `NormalizedEvent`.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ValidationError;

pub const EVENT_UUID_FIELD: &str = "event_uuid";
pub const EVENT_NAME_FIELD: &str = "event_name";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const EVENT_TYPE_FIELD: &str = "event_type";
pub const EVENT_SUBTYPE_FIELD: &str = "event_subtype";
pub const CREATED_DATETIME_FIELD: &str = "created_datetime";

const EVENT_NAME_SEPARATOR: char = ':';

// 9999-12-31T23:59:59Z, the last instant with a four digit year
const MAX_CREATED_AT: i64 = 253_402_300_799;

/// A decoded stream payload: string keys mapped to arbitrary JSON values.
pub type RawEvent = Map<String, Value>;

/// Decode the bytes of a stream record into a `RawEvent`.
pub fn parse_payload(payload: Option<&[u8]>) -> Result<RawEvent, ValidationError> {
    let bytes = match payload {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Err(ValidationError::EmptyPayload),
    };

    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationError::NotAnObject),
        Err(e) => Err(ValidationError::MalformedJson(e.to_string())),
    }
}

/// A raw event plus its derived fields.
///
/// `document` is the exact JSON object that gets persisted: every raw field, with
/// `event_type`, `event_subtype` and `created_datetime` set from the derivation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_uuid: String,
    pub event_name: String,
    pub event_type: String,
    pub event_subtype: String,
    pub created_at: i64,
    pub created_datetime: String,
    created: DateTime<Utc>,
    document: Map<String, Value>,
}

impl NormalizedEvent {
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn year(&self) -> i32 {
        self.created.year()
    }

    pub fn month(&self) -> u32 {
        self.created.month()
    }

    pub fn day(&self) -> u32 {
        self.created.day()
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.document)
    }
}

impl Serialize for NormalizedEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.document.serialize(serializer)
    }
}

/// Validate the required fields of `raw` and derive the enrichment fields.
pub fn normalize(raw: RawEvent) -> Result<NormalizedEvent, ValidationError> {
    let event_uuid = required_string(&raw, EVENT_UUID_FIELD)?;
    let event_name = required_string(&raw, EVENT_NAME_FIELD)?;
    let created_at = required_timestamp(&raw)?;

    let mut segments = event_name.split(EVENT_NAME_SEPARATOR);
    let event_type = segments.next().unwrap_or_default().to_string();
    let event_subtype = segments.next().unwrap_or_default().to_string();

    if event_type.is_empty() {
        return Err(ValidationError::EmptyField(EVENT_TYPE_FIELD));
    }
    reject_path_separator(EVENT_UUID_FIELD, &event_uuid)?;
    reject_path_separator(EVENT_TYPE_FIELD, &event_type)?;
    reject_path_separator(EVENT_SUBTYPE_FIELD, &event_subtype)?;

    let created = DateTime::<Utc>::from_timestamp(created_at, 0)
        .ok_or(ValidationError::InvalidTimestamp(created_at))?;
    let created_datetime = created.to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut document = raw;
    document.insert(
        EVENT_TYPE_FIELD.to_string(),
        Value::String(event_type.clone()),
    );
    document.insert(
        EVENT_SUBTYPE_FIELD.to_string(),
        Value::String(event_subtype.clone()),
    );
    document.insert(
        CREATED_DATETIME_FIELD.to_string(),
        Value::String(created_datetime.clone()),
    );

    Ok(NormalizedEvent {
        event_uuid,
        event_name,
        event_type,
        event_subtype,
        created_at,
        created_datetime,
        created,
        document,
    })
}

fn required_string(raw: &RawEvent, field: &'static str) -> Result<String, ValidationError> {
    match raw.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) if s.is_empty() => Err(ValidationError::EmptyField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "string",
        }),
    }
}

fn required_timestamp(raw: &RawEvent) -> Result<i64, ValidationError> {
    let value = match raw.get(CREATED_AT_FIELD) {
        None | Some(Value::Null) => return Err(ValidationError::MissingField(CREATED_AT_FIELD)),
        Some(value) => value,
    };

    let Some(created_at) = value.as_i64() else {
        return Err(ValidationError::WrongType {
            field: CREATED_AT_FIELD,
            expected: "integer unix timestamp",
        });
    };

    if !(0..=MAX_CREATED_AT).contains(&created_at) {
        return Err(ValidationError::InvalidTimestamp(created_at));
    }

    Ok(created_at)
}

fn reject_path_separator(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.contains('/') {
        return Err(ValidationError::PathSeparator {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
