//! Newline-delimited JSON wire format for persisted logs and traces.
//!
//! One record per line; timestamps are integer nanoseconds and angles are
//! wrapped to [0, 360) by the producing component before serialization.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Serializes a record to a single JSONL line (no trailing newline).
pub fn to_jsonl_line<T: Serialize>(record: &T) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

/// Parses one JSONL line into a record.
pub fn from_jsonl_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Parses a whole JSONL document, skipping blank lines.
pub fn from_jsonl<T: DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(from_jsonl_line)
        .collect()
}
