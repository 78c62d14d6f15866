//! Typed views over the raw field maps of stream entries.
//!
//! Everything read from a stream goes through this module before any business logic runs.
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use stream_common::streams::StreamEntry;

use crate::companies::normalize_source;
use crate::error::DecodeError;

/// Fields that, when present on a record entry without a `records` array, describe a single record.
const INLINE_RECORD_FIELDS: [&str; 4] = ["url", "title", "published_at", "thumbnail_url"];

/// An entry together with the outcome of decoding it.
/// The entry is kept around so it can be acknowledged or dead-lettered by id.
#[derive(Debug)]
pub struct Decoded<T> {
    pub entry: StreamEntry,
    pub value: Result<T, DecodeError>,
}

impl<T> Decoded<T> {
    pub fn id(&self) -> &str {
        &self.entry.id
    }
}

/// "Producer finished batch `batch_id` with `expected_count` records for `source`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSentinel {
    pub batch_id: String,
    pub source: String,
    pub expected_count: u64,
}

impl CompletionSentinel {
    pub fn decode(entry: &StreamEntry) -> Result<Self, DecodeError> {
        reject_invalid_utf8(entry)?;
        let batch_id = entry
            .non_blank("batch_id")
            .ok_or(DecodeError::MissingField("batch_id"))?;
        let source = entry
            .non_blank("source")
            .map(normalize_source)
            .ok_or(DecodeError::MissingField("source"))?;

        // An unparseable count is not fatal, the sentinel still registers the batch.
        let expected_count = entry
            .non_blank("row_count")
            .or_else(|| entry.non_blank("count"))
            .and_then(|count| count.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Self {
            batch_id: batch_id.to_owned(),
            source,
            expected_count,
        })
    }
}

/// A single news item. Only items with a url are ever written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordItem {
    pub url: Option<String>,
    pub title: Option<String>,
    pub published_at: Option<String>,
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RecordItem {
    fn from_object(object: &Map<String, Value>) -> Self {
        Self {
            url: text(object.get("url")),
            title: text(object.get("title")),
            published_at: text(object.get("published_at")),
            thumbnail_url: text(object.get("thumbnail_url")),
            source: text(object.get("source")),
        }
    }

    fn from_inline(entry: &StreamEntry) -> Self {
        let field = |name: &str| entry.get(name).map(str::to_owned);
        Self {
            url: field("url"),
            title: field("title"),
            published_at: field("published_at"),
            thumbnail_url: field("thumbnail_url"),
            source: field("source"),
        }
    }

    /// The url, if it is not blank.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// Scalars are kept as text; null, arrays and objects count as absent.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// A chunk of records published for one (batch, source).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub batch_id: Option<String>,
    /// Normalized source. Falls back to the first record's source when the entry has none.
    pub source: Option<String>,
    pub schema: Option<String>,
    pub declared_count: Option<u64>,
    pub records: Vec<RecordItem>,
}

impl RecordBatch {
    pub fn decode(entry: &StreamEntry) -> Result<Self, DecodeError> {
        reject_invalid_utf8(entry)?;
        let mut records = match entry.non_blank("records") {
            None => Vec::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw)? {
                Value::Null => Vec::new(),
                Value::Array(items) => items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        item.as_object()
                            .map(RecordItem::from_object)
                            .ok_or(DecodeError::RecordNotObject(index))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => return Err(DecodeError::RecordsNotArray),
            },
        };

        if records.is_empty() && entry.has_any(&INLINE_RECORD_FIELDS) {
            records.push(RecordItem::from_inline(entry));
        }

        let source = entry
            .non_blank("source")
            .or_else(|| {
                records
                    .first()
                    .and_then(|record| record.source.as_deref())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            })
            .map(normalize_source);

        Ok(Self {
            batch_id: entry.non_blank("batch_id").map(str::to_owned),
            source,
            schema: entry.non_blank("schema").map(str::to_owned),
            declared_count: entry
                .non_blank("count")
                .and_then(|count| count.parse().ok()),
            records,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Lossy copies would decode into altered values, so any such field fails the whole entry.
fn reject_invalid_utf8(entry: &StreamEntry) -> Result<(), DecodeError> {
    match entry.invalid_utf8.iter().next() {
        Some(field) => Err(DecodeError::InvalidUtf8(field.clone())),
        None => Ok(()),
    }
}

/// Reduce an ISO-like timestamp to its calendar date.
///
/// Values whose first ten characters are not a `YYYY-MM-DD` date are passed through trimmed,
/// leaving the store to accept or reject them. Blank values become `None`.
pub fn normalize_published_at(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.get(..10) {
        Some(date) if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok() => Some(date.to_owned()),
        _ => Some(trimmed.to_owned()),
    }
}
