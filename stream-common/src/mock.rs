use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;

use crate::streams::{
    GroupCreation, GroupSummary, StreamClient, StreamEntry, StreamError, StreamResult,
    StreamSummary,
};

/// An in-memory `StreamClient` with consumer group bookkeeping, for tests.
///
/// Ids are `<seq>-0` with a per-stream sequence starting at 1. Groups track a last-delivered
/// sequence and a pending set, which is enough to exercise at-least-once consumers.
#[derive(Clone, Default)]
pub struct MockStreamClient {
    state: Arc<Mutex<MockState>>,
    calls: Arc<Mutex<Vec<MockStreamCall>>>,
}

#[derive(Default)]
struct MockState {
    streams: HashMap<String, MockStream>,
    failures: HashSet<(String, String)>,
}

#[derive(Default)]
struct MockStream {
    entries: Vec<(u64, StreamEntry)>,
    last_seq: u64,
    groups: HashMap<String, MockGroup>,
}

#[derive(Default)]
struct MockGroup {
    last_delivered: u64,
    pending: BTreeSet<u64>,
    consumers: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStreamCall {
    CreateGroup { stream: String, group: String, start_id: String },
    SetGroupId { stream: String, group: String, id: String },
    ReadGroup { stream: String, group: String, count: usize },
    Ack { stream: String, group: String, ids: Vec<String> },
    Delete { stream: String, ids: Vec<String> },
    Pending { stream: String, group: String },
    Append { stream: String, max_len: Option<usize> },
    Trim { stream: String, max_len: usize },
    Summary { stream: String },
}

fn seq_of(id: &str) -> Option<u64> {
    id.split('-').next().and_then(|s| s.parse().ok())
}

fn id_of(seq: u64) -> String {
    format!("{}-0", seq)
}

fn no_such_key(command: &str, stream: &str) -> StreamError {
    StreamError::command(command, stream, redis::ErrorKind::ResponseError, "no such key")
}

impl MockStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockStreamCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, call: MockStreamCall) {
        self.lock_calls().push(call);
    }

    fn check_failure(&self, command: &str, stream: &str) -> StreamResult<()> {
        if self
            .lock_state()
            .failures
            .contains(&(command.to_owned(), stream.to_owned()))
        {
            return Err(StreamError::command(
                command,
                stream,
                redis::ErrorKind::IoError,
                "injected failure",
            ));
        }
        Ok(())
    }

    /// Make every future `command` against `stream` fail with an I/O error.
    /// Commands are named as in Redis: XADD, XACK, XREADGROUP, XINFO GROUPS...
    pub fn fail_command(&mut self, command: &str, stream: &str) -> Self {
        self.lock_state()
            .failures
            .insert((command.to_owned(), stream.to_owned()));
        self.clone()
    }

    /// Append an entry synchronously, returning its id.
    pub fn seed(&self, stream: &str, pairs: &[(&str, &str)]) -> String {
        let mut state = self.lock_state();
        let stream = state.streams.entry(stream.to_owned()).or_default();
        stream.last_seq += 1;
        let id = id_of(stream.last_seq);
        let entry = StreamEntry::from_pairs(&id, pairs);
        stream.entries.push((stream.last_seq, entry));
        id
    }

    /// All entries currently stored in `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock_state()
            .streams
            .get(stream)
            .map(|s| s.entries.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        self.lock_state()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.iter().map(|seq| id_of(*seq)).collect())
            .unwrap_or_default()
    }

    pub fn get_calls(&self) -> Vec<MockStreamCall> {
        self.lock_calls().clone()
    }

    fn take_undelivered(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut state = self.lock_state();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_such_key("XREADGROUP", stream))?;
        let MockStream {
            entries, groups, ..
        } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| {
            StreamError::command(
                "XREADGROUP",
                stream,
                redis::ErrorKind::ResponseError,
                "NOGROUP no such consumer group",
            )
        })?;
        group_state.consumers.insert(consumer.to_owned());

        let delivered: Vec<(u64, StreamEntry)> = entries
            .iter()
            .filter(|(seq, _)| *seq > group_state.last_delivered)
            .take(count)
            .cloned()
            .collect();

        for (seq, _) in delivered.iter() {
            group_state.last_delivered = *seq;
            group_state.pending.insert(*seq);
        }

        Ok(delivered.into_iter().map(|(_, entry)| entry).collect())
    }
}

#[async_trait]
impl StreamClient for MockStreamClient {
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> StreamResult<GroupCreation> {
        self.record(MockStreamCall::CreateGroup {
            stream: stream.to_owned(),
            group: group.to_owned(),
            start_id: start_id.to_owned(),
        });
        self.check_failure("XGROUP CREATE", stream)?;

        let mut state = self.lock_state();
        let stream_state = state.streams.entry(stream.to_owned()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let last_delivered = if start_id == "$" {
            stream_state.last_seq
        } else {
            seq_of(start_id).unwrap_or(0)
        };
        stream_state.groups.insert(
            group.to_owned(),
            MockGroup {
                last_delivered,
                ..Default::default()
            },
        );

        Ok(GroupCreation::Created)
    }

    async fn set_group_id(&self, stream: &str, group: &str, id: &str) -> StreamResult<()> {
        self.record(MockStreamCall::SetGroupId {
            stream: stream.to_owned(),
            group: group.to_owned(),
            id: id.to_owned(),
        });
        self.check_failure("XGROUP SETID", stream)?;

        let mut state = self.lock_state();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_such_key("XGROUP SETID", stream))?;
        let last = stream_state.last_seq;
        match stream_state.groups.get_mut(group) {
            Some(group_state) => {
                group_state.last_delivered = if id == "$" {
                    last
                } else {
                    seq_of(id).unwrap_or(0)
                };
                Ok(())
            }
            None => Err(StreamError::command(
                "XGROUP SETID",
                stream,
                redis::ErrorKind::ResponseError,
                "NOGROUP no such consumer group",
            )),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: time::Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        self.record(MockStreamCall::ReadGroup {
            stream: stream.to_owned(),
            group: group.to_owned(),
            count,
        });
        self.check_failure("XREADGROUP", stream)?;

        let entries = self.take_undelivered(stream, group, consumer, count)?;
        if !entries.is_empty() || block.is_zero() {
            return Ok(entries);
        }

        tokio::time::sleep(block).await;
        self.take_undelivered(stream, group, consumer, count)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<u64> {
        self.record(MockStreamCall::Ack {
            stream: stream.to_owned(),
            group: group.to_owned(),
            ids: ids.to_vec(),
        });
        self.check_failure("XACK", stream)?;

        let mut state = self.lock_state();
        let acked = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| {
                ids.iter()
                    .filter_map(|id| seq_of(id))
                    .filter(|seq| g.pending.remove(seq))
                    .count() as u64
            })
            .unwrap_or(0);

        Ok(acked)
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> StreamResult<u64> {
        self.record(MockStreamCall::Delete {
            stream: stream.to_owned(),
            ids: ids.to_vec(),
        });
        self.check_failure("XDEL", stream)?;

        let mut state = self.lock_state();
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = stream_state.entries.len();
        stream_state.entries.retain(|(_, e)| !ids.contains(&e.id));

        Ok((before - stream_state.entries.len()) as u64)
    }

    async fn pending(&self, stream: &str, group: &str) -> StreamResult<u64> {
        self.record(MockStreamCall::Pending {
            stream: stream.to_owned(),
            group: group.to_owned(),
        });
        self.check_failure("XINFO GROUPS", stream)?;

        let state = self.lock_state();
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| no_such_key("XINFO GROUPS", stream))?;

        Ok(stream_state
            .groups
            .get(group)
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> StreamResult<String> {
        self.record(MockStreamCall::Append {
            stream: stream.to_owned(),
            max_len,
        });
        self.check_failure("XADD", stream)?;

        let mut state = self.lock_state();
        let stream_state = state.streams.entry(stream.to_owned()).or_default();
        stream_state.last_seq += 1;
        let id = id_of(stream_state.last_seq);
        let entry = StreamEntry::new(&id, fields.iter().cloned().collect());
        stream_state.entries.push((stream_state.last_seq, entry));

        if let Some(len) = max_len {
            let excess = stream_state.entries.len().saturating_sub(len);
            stream_state.entries.drain(..excess);
        }

        Ok(id)
    }

    async fn trim(&self, stream: &str, max_len: usize) -> StreamResult<u64> {
        self.record(MockStreamCall::Trim {
            stream: stream.to_owned(),
            max_len,
        });
        self.check_failure("XTRIM", stream)?;

        let mut state = self.lock_state();
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let excess = stream_state.entries.len().saturating_sub(max_len);
        stream_state.entries.drain(..excess);

        Ok(excess as u64)
    }

    async fn summary(&self, stream: &str) -> StreamResult<StreamSummary> {
        self.record(MockStreamCall::Summary {
            stream: stream.to_owned(),
        });
        self.check_failure("XINFO STREAM", stream)?;

        let state = self.lock_state();
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| no_such_key("XINFO STREAM", stream))?;

        let mut groups: Vec<GroupSummary> = stream_state
            .groups
            .iter()
            .map(|(name, g)| GroupSummary {
                name: name.clone(),
                consumers: g.consumers.len() as u64,
                pending: g.pending.len() as u64,
                last_delivered_id: id_of(g.last_delivered),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(StreamSummary {
            length: stream_state.entries.len() as u64,
            last_generated_id: id_of(stream_state.last_seq),
            groups,
        })
    }
}
