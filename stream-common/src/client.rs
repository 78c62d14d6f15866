use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamInfoGroupsReply, StreamInfoStreamReply, StreamMaxlen, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use tokio::time::timeout;
use tracing::warn;

use crate::streams::{
    GroupCreation, GroupSummary, StreamClient, StreamEntry, StreamError, StreamResult,
    StreamSummary,
};

/// Error code returned by XGROUP CREATE when the group is already there.
const BUSYGROUP: &str = "BUSYGROUP";

/// Upper bound on one command round trip, added on top of any BLOCK the command asks for.
const COMMAND_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// A `StreamClient` backed by Redis Streams.
pub struct RedisStreamClient {
    connection: MultiplexedConnection,
}

impl RedisStreamClient {
    /// Connect to the Redis server at `addr` and check it answers a PING.
    pub async fn new(addr: &str) -> StreamResult<Self> {
        let client =
            redis::Client::open(addr).map_err(|error| StreamError::ConnectionError { error })?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| StreamError::ConnectionError { error })?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
            .map_err(|error| StreamError::ConnectionError { error })?;

        Ok(Self { connection })
    }

    fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn command_error<'a>(
    command: &'a str,
    stream: &'a str,
) -> impl FnOnce(RedisError) -> StreamError + 'a {
    move |error| StreamError::CommandError {
        command: command.to_owned(),
        stream: stream.to_owned(),
        error,
    }
}

fn timed_out(command: &str, stream: &str) -> StreamError {
    StreamError::Timeout {
        command: command.to_owned(),
        stream: stream.to_owned(),
    }
}

/// Await a redis command for at most `COMMAND_TIMEOUT` plus `wait`.
async fn bounded<T, F>(
    command: &str,
    stream: &str,
    wait: time::Duration,
    fut: F,
) -> StreamResult<Result<T, RedisError>>
where
    F: Future<Output = Result<T, RedisError>>,
{
    timeout(COMMAND_TIMEOUT + wait, fut)
        .await
        .map_err(|_| timed_out(command, stream))
}

/// Like `bounded`, mapping redis errors to a `CommandError`.
async fn run<T, F>(command: &str, stream: &str, wait: time::Duration, fut: F) -> StreamResult<T>
where
    F: Future<Output = Result<T, RedisError>>,
{
    bounded(command, stream, wait, fut)
        .await?
        .map_err(command_error(command, stream))
}

/// Convert a raw stream entry. Values that are not valid UTF-8 are kept as lossy copies and
/// flagged on the entry, so decoding can reject it instead of seeing a missing field.
fn into_entry(id: redis::streams::StreamId) -> StreamEntry {
    let mut fields = HashMap::with_capacity(id.map.len());
    let mut invalid = BTreeSet::new();

    for (field, value) in id.map.iter() {
        match redis::from_redis_value::<String>(value) {
            Ok(value) => {
                fields.insert(field.clone(), value);
            }
            Err(_) => {
                warn!(id = %id.id, field = %field, "stream field is not valid utf-8");
                let lossy = match value {
                    redis::Value::Data(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    _ => String::new(),
                };
                fields.insert(field.clone(), lossy);
                invalid.insert(field.clone());
            }
        }
    }

    StreamEntry::new(&id.id, fields).with_invalid_utf8(invalid)
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> StreamResult<GroupCreation> {
        let mut conn = self.connection();

        match bounded(
            "XGROUP CREATE",
            stream,
            time::Duration::ZERO,
            conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, start_id),
        )
        .await?
        {
            Ok(()) => Ok(GroupCreation::Created),
            Err(error) if error.code() == Some(BUSYGROUP) => Ok(GroupCreation::AlreadyExists),
            Err(error) => Err(command_error("XGROUP CREATE", stream)(error)),
        }
    }

    async fn set_group_id(&self, stream: &str, group: &str, id: &str) -> StreamResult<()> {
        let mut conn = self.connection();

        run(
            "XGROUP SETID",
            stream,
            time::Duration::ZERO,
            conn.xgroup_setid::<_, _, _, ()>(stream, group, id),
        )
        .await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: time::Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut conn = self.connection();

        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // BLOCK 0 means "wait forever" to Redis, so a zero timeout is sent as no BLOCK at all.
        let block_ms = block.as_millis() as usize;
        if block_ms > 0 {
            options = options.block(block_ms);
        }

        let reply: Option<StreamReadReply> = run(
            "XREADGROUP",
            stream,
            block,
            conn.xread_options(&[stream], &[">"], &options),
        )
        .await?;

        let entries = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids.into_iter())
                    .map(into_entry)
                    .collect()
            })
            .unwrap_or_default();

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection();

        run(
            "XACK",
            stream,
            time::Duration::ZERO,
            conn.xack(stream, group, ids),
        )
        .await
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> StreamResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection();

        run("XDEL", stream, time::Duration::ZERO, conn.xdel(stream, ids)).await
    }

    async fn pending(&self, stream: &str, group: &str) -> StreamResult<u64> {
        let mut conn = self.connection();

        let reply: StreamInfoGroupsReply = run(
            "XINFO GROUPS",
            stream,
            time::Duration::ZERO,
            conn.xinfo_groups(stream),
        )
        .await?;

        Ok(reply
            .groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.pending as u64)
            .unwrap_or(0))
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> StreamResult<String> {
        let mut conn = self.connection();

        match max_len {
            Some(len) => {
                run(
                    "XADD",
                    stream,
                    time::Duration::ZERO,
                    conn.xadd_maxlen(stream, StreamMaxlen::Approx(len), "*", fields),
                )
                .await
            }
            None => {
                run(
                    "XADD",
                    stream,
                    time::Duration::ZERO,
                    conn.xadd(stream, "*", fields),
                )
                .await
            }
        }
    }

    async fn trim(&self, stream: &str, max_len: usize) -> StreamResult<u64> {
        let mut conn = self.connection();

        run(
            "XTRIM",
            stream,
            time::Duration::ZERO,
            conn.xtrim(stream, StreamMaxlen::Approx(max_len)),
        )
        .await
    }

    async fn summary(&self, stream: &str) -> StreamResult<StreamSummary> {
        let mut conn = self.connection();

        let info: StreamInfoStreamReply = run(
            "XINFO STREAM",
            stream,
            time::Duration::ZERO,
            conn.xinfo_stream(stream),
        )
        .await?;
        let groups: StreamInfoGroupsReply = run(
            "XINFO GROUPS",
            stream,
            time::Duration::ZERO,
            conn.xinfo_groups(stream),
        )
        .await?;

        Ok(StreamSummary {
            length: info.length as u64,
            last_generated_id: info.last_generated_id,
            groups: groups
                .groups
                .into_iter()
                .map(|g| GroupSummary {
                    name: g.name,
                    consumers: g.consumers as u64,
                    pending: g.pending as u64,
                    last_delivered_id: g.last_delivered_id,
                })
                .collect(),
        })
    }
}
