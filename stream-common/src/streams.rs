use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time;

use async_trait::async_trait;
use thiserror::Error;

/// Enumeration of errors for operations on group-based streams.
/// Errors originate from the redis client and are wrapped by us to provide the failing command.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: redis::RedisError },
    #[error("{command} on {stream} failed with: {error}")]
    CommandError {
        command: String,
        stream: String,
        error: redis::RedisError,
    },
    #[error("{command} on {stream} timed out")]
    Timeout { command: String, stream: String },
}

impl StreamError {
    /// Build a `CommandError` out of a bare redis error kind, mostly for tests and mocks.
    pub fn command(
        command: &str,
        stream: &str,
        kind: redis::ErrorKind,
        detail: &'static str,
    ) -> Self {
        StreamError::CommandError {
            command: command.to_owned(),
            stream: stream.to_owned(),
            error: redis::RedisError::from((kind, detail)),
        }
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// A single delivery from a stream: an opaque, monotonic id and the entry's field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
    /// Fields whose raw value was not valid UTF-8. Their value in `fields` is a lossy copy.
    pub invalid_utf8: BTreeSet<String>,
}

impl StreamEntry {
    pub fn new(id: &str, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.to_owned(),
            fields,
            invalid_utf8: BTreeSet::new(),
        }
    }

    /// Flag `fields` as holding lossy copies of values that were not valid UTF-8.
    pub fn with_invalid_utf8<I, T>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.invalid_utf8.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Build an entry from borrowed pairs, mostly useful to build test fixtures.
    pub fn from_pairs(id: &str, pairs: &[(&str, &str)]) -> Self {
        let fields = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Self::new(id, fields)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// The trimmed value of `field`, or `None` if the field is absent or blank.
    pub fn non_blank(&self, field: &str) -> Option<&str> {
        self.get(field).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn has_any(&self, fields: &[&str]) -> bool {
        fields.iter().any(|f| self.fields.contains_key(*f))
    }
}

/// Result of asking for a consumer group to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: String,
}

/// Point-in-time description of a stream and its consumer groups, for logging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSummary {
    pub length: u64,
    pub last_generated_id: String,
    pub groups: Vec<GroupSummary>,
}

/// An entry that failed processing, bound for a dead-letter stream.
/// Dead letters are written once and never read back by the consumer that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub origin_stream: String,
    pub origin_id: String,
    pub reason: String,
    pub fields: HashMap<String, String>,
}

impl DeadLetter {
    pub fn new(origin_stream: &str, entry: &StreamEntry, reason: &str) -> Self {
        Self {
            origin_stream: origin_stream.to_owned(),
            origin_id: entry.id.clone(),
            reason: reason.to_owned(),
            fields: entry.fields.clone(),
        }
    }

    /// Wire representation: `stream`, `msg_id`, `reason` and the original fields as a JSON object.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let ordered: BTreeMap<&String, &String> = self.fields.iter().collect();
        let original = serde_json::to_string(&ordered).unwrap_or_else(|_| "{}".to_owned());

        vec![
            ("stream".to_owned(), self.origin_stream.clone()),
            ("msg_id".to_owned(), self.origin_id.clone()),
            ("reason".to_owned(), self.reason.clone()),
            ("fields".to_owned(), original),
        ]
    }
}

/// A client for append-only streams read through consumer groups.
///
/// Delivery is at-least-once: entries read through a group stay pending for that group
/// until they are acknowledged.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Create `group` on `stream` starting after `start_id`, creating the stream if needed.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> StreamResult<GroupCreation>;

    /// Move the last-delivered cursor of an existing group.
    async fn set_group_id(&self, stream: &str, group: &str, id: &str) -> StreamResult<()>;

    /// Read up to `count` never-delivered entries for `consumer`, waiting at most `block`.
    /// A zero `block` does not wait at all.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: time::Duration,
    ) -> StreamResult<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<u64>;

    async fn delete(&self, stream: &str, ids: &[String]) -> StreamResult<u64>;

    /// Number of entries delivered to `group` but not yet acknowledged.
    /// A group that does not exist has nothing pending.
    async fn pending(&self, stream: &str, group: &str) -> StreamResult<u64>;

    /// Append an entry and return its id. `max_len` caps the stream approximately.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> StreamResult<String>;

    /// Approximately trim `stream` down to `max_len` entries, returning how many were evicted.
    async fn trim(&self, stream: &str, max_len: usize) -> StreamResult<u64>;

    async fn summary(&self, stream: &str) -> StreamResult<StreamSummary>;
}
