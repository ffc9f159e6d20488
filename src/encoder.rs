//! Gzip-compressed NDJSON encoding of ingestion batches

use crate::errors::{ClientError, Result};
use crate::record::LogRecord;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::{Map, Value};
use std::io::{Read, Write};

/// Content type of an encoded batch
pub const CONTENT_TYPE: &str = "application/x-ndjson";

/// Content encoding of an encoded batch
pub const CONTENT_ENCODING: &str = "gzip";

/// Serialize records as newline-delimited JSON, one record per line in
/// batch order, and gzip the stream.
pub fn encode(records: &[LogRecord]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for record in records {
        let line = serde_json::to_vec(&record.to_json())
            .map_err(|e| ClientError::Encode(e.to_string()))?;
        encoder.write_all(&line)?;
        encoder.write_all(b"\n")?;
    }

    Ok(encoder.finish()?)
}

/// Encode arbitrary JSON objects the same way as [`encode`].
pub fn encode_events(events: &[Map<String, Value>]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        serde_json::to_writer(&mut encoder, event)
            .map_err(|e| ClientError::Encode(e.to_string()))?;
        encoder.write_all(b"\n")?;
    }

    Ok(encoder.finish()?)
}

/// Inverse of [`encode`]: decompress and parse each non-empty line.
pub fn decode(bytes: &[u8]) -> Result<Vec<Map<String, Value>>> {
    let mut text = String::new();
    GzDecoder::new(bytes).read_to_string(&mut text)?;

    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<Value>(line)? {
            Value::Object(object) => Ok(object),
            other => Err(ClientError::Encode(format!(
                "expected a JSON object per line, got {}",
                other
            ))),
        })
        .collect()
}
