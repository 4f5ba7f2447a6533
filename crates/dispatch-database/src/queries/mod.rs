//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter, so callers
//! can run them on a plain connection or inside a transaction they own
//! (an outbox insert belongs in the same transaction as the domain write).

mod operations;
mod outbox_events;

pub use operations::*;
pub use outbox_events::*;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn opt_to_millis(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_millis)
}

/// Decode an INTEGER millisecond column inside a row mapper.
pub(crate) fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {ms}ms is out of range").into(),
        )
    })
}

pub(crate) fn opt_from_millis(idx: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_millis(idx, ms)).transpose()
}

/// Parse a JSON text column inside a row mapper.
pub(crate) fn json_column(idx: usize, raw: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Bind a list of ids as one JSON array, expanded with `json_each`.
///
/// Keeps statements at a fixed parameter count however many ids are bound.
pub(crate) fn json_id_list<S: AsRef<str>>(ids: &[S]) -> String {
    serde_json::Value::Array(
        ids.iter()
            .map(|id| serde_json::Value::String(id.as_ref().to_string()))
            .collect(),
    )
    .to_string()
}
