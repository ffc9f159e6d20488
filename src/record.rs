//! Log records, ingestion batches and ingestion status

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Reserved field carrying the event timestamp
pub const TIMESTAMP_FIELD: &str = "_time";

/// A single field value of a log record.
///
/// Values that JSON cannot represent directly are converted to a canonical
/// string when the record is encoded.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
    Duration(Duration),
    Uuid(Uuid),
    Json(Value),
}

impl FieldValue {
    /// Convert to a JSON value, canonicalizing non-JSON types.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::I64(n) => Value::from(*n),
            FieldValue::U64(n) => Value::from(*n),
            FieldValue::F64(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(n.to_string())),
            FieldValue::Str(s) => Value::String(s.clone()),
            FieldValue::Timestamp(ts) => Value::String(format_timestamp(ts)),
            FieldValue::Duration(d) => Value::String(format_duration(d)),
            FieldValue::Uuid(id) => Value::String(id.hyphenated().to_string()),
            FieldValue::Json(v) => v.clone(),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I64(v.into())
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl From<Duration> for FieldValue {
    fn from(v: Duration) -> Self {
        FieldValue::Duration(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Uuid(v)
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::String(s) => FieldValue::Str(s),
            other => FieldValue::Json(other),
        }
    }
}

/// A structured log event awaiting ingestion.
///
/// Always carries [`TIMESTAMP_FIELD`]; it defaults to the creation time and
/// may be replaced by the producer before the record is appended.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl LogRecord {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(TIMESTAMP_FIELD.to_string(), FieldValue::Timestamp(timestamp));
        Self { fields }
    }

    /// Build a record from a JSON object, keeping every field.
    ///
    /// An RFC 3339 `_time` value becomes the record timestamp; any other
    /// `_time` value is kept verbatim for the service to interpret.
    pub fn from_json(object: serde_json::Map<String, Value>) -> Self {
        let mut record = Self::new();
        for (key, value) in object {
            let value = match (&key[..], value) {
                (TIMESTAMP_FIELD, Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
                    Ok(ts) => FieldValue::Timestamp(ts.with_timezone(&Utc)),
                    Err(_) => FieldValue::Str(s),
                },
                (_, value) => value.into(),
            };
            record.fields.insert(key, value);
        }
        record
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        self.with_field("message", message.into())
    }

    pub fn with_timestamp(self, timestamp: DateTime<Utc>) -> Self {
        self.with_field(TIMESTAMP_FIELD, timestamp)
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.fields.get(TIMESTAMP_FIELD) {
            Some(FieldValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Canonical JSON object for this record.
    pub fn to_json(&self) -> serde_json::Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

impl Default for LogRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable, ordered snapshot of buffered records.
#[derive(Clone, Debug)]
pub struct IngestBatch {
    pub batch_id: String,
    records: Vec<LogRecord>,
}

impl IngestBatch {
    pub fn new(records: Vec<LogRecord>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            records,
        }
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Split into consecutive batches of at most `size` records.
    pub fn chunks(self, size: usize) -> Vec<IngestBatch> {
        let size = size.max(1);
        if self.records.len() <= size {
            return vec![self];
        }

        let mut records = self.records.into_iter();
        let mut batches = Vec::new();
        loop {
            let chunk: Vec<LogRecord> = records.by_ref().take(size).collect();
            if chunk.is_empty() {
                break;
            }
            batches.push(IngestBatch::new(chunk));
        }
        batches
    }
}

/// The ingestion failure of a single event
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngestFailure {
    pub timestamp: Option<DateTime<Utc>>,
    pub error: String,
}

/// The status after an event ingestion operation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestStatus {
    pub ingested: u64,
    pub failed: u64,
    pub failures: Vec<IngestFailure>,
    pub processed_bytes: u64,
    pub blocks_created: u64,
    pub wal_length: u64,
}

/// Format a timestamp the way the service expects: RFC 3339, UTC, `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Format a duration in the coarsest unit that keeps it exact:
/// `"90s"`, `"1500ms"`, `"250us"` or `"42ns"`.
pub fn format_duration(d: &Duration) -> String {
    let nanos = d.subsec_nanos();
    if nanos == 0 {
        format!("{}s", d.as_secs())
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else if nanos % 1_000 == 0 {
        format!("{}us", d.as_micros())
    } else {
        format!("{}ns", d.as_nanos())
    }
}
