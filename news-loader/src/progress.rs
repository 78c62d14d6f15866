use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifies the work a producer announced: one batch of one source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgressKey {
    pub batch_id: String,
    pub source: String,
}

impl ProgressKey {
    pub fn new(batch_id: &str, source: &str) -> Self {
        Self {
            batch_id: batch_id.to_owned(),
            source: source.to_owned(),
        }
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.batch_id, self.source)
    }
}

/// Expected and written record counts per (batch, source).
///
/// Lives only in process memory: a restarted loader starts from an empty table.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    expected: BTreeMap<ProgressKey, u64>,
    done: BTreeMap<ProgressKey, u64>,
}

impl Progress {
    /// Record the announced count for `key`. A later announcement replaces an earlier one.
    pub fn expect(&mut self, key: ProgressKey, count: u64) {
        self.expected.insert(key, count);
    }

    /// Add `written` records to the done count of `key`. Done counts never decrease.
    pub fn record_done(&mut self, key: ProgressKey, written: u64) {
        *self.done.entry(key).or_default() += written;
    }

    pub fn expected(&self) -> &BTreeMap<ProgressKey, u64> {
        &self.expected
    }

    pub fn done(&self, key: &ProgressKey) -> u64 {
        self.done.get(key).copied().unwrap_or(0)
    }

    /// Sources that announced at least one batch.
    pub fn sources(&self) -> BTreeSet<&str> {
        self.expected.keys().map(|key| key.source.as_str()).collect()
    }

    /// Whether every announced batch has at least as many written records as announced.
    /// Vacuously true when nothing was announced.
    pub fn all_done(&self) -> bool {
        self.expected
            .iter()
            .all(|(key, expected)| self.done(key) >= *expected)
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: BTreeSet<&ProgressKey> = self.expected.keys().chain(self.done.keys()).collect();

        write!(f, "[")?;
        for (index, key) in keys.into_iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            match self.expected.get(key) {
                Some(expected) => write!(f, "{}={}/{}", key, self.done(key), expected)?,
                None => write!(f, "{}={}/?", key, self.done(key))?,
            }
        }
        write!(f, "]")
    }
}
