use std::time;

use stream_common::streams::{
    DeadLetter, GroupCreation, StreamClient, StreamEntry, StreamResult, StreamSummary,
};
use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::decode::{CompletionSentinel, Decoded, RecordBatch};

/// The two streams the loader consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Records,
    Completions,
}

/// Pending counts of both consumer groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingCounts {
    pub records: u64,
    pub completions: u64,
}

impl PendingCounts {
    pub fn is_zero(&self) -> bool {
        self.records == 0 && self.completions == 0
    }
}

/// Group-based access to the records and completions streams.
pub struct StreamConsumer<C> {
    client: C,
    config: StreamConfig,
}

impl<C: StreamClient> StreamConsumer<C> {
    pub fn new(client: C, config: StreamConfig) -> Self {
        Self { client, config }
    }

    fn stream(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Records => &self.config.records,
            StreamKind::Completions => &self.config.completions,
        }
    }

    fn group(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Records => &self.config.records_group,
            StreamKind::Completions => &self.config.completions_group,
        }
    }

    fn start_id(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Records => &self.config.records_start,
            StreamKind::Completions => &self.config.completions_start,
        }
    }

    /// Create both streams and groups if they do not exist yet. Safe to call on every start.
    pub async fn ensure_groups(&self) -> StreamResult<()> {
        for kind in [StreamKind::Completions, StreamKind::Records] {
            let (stream, group, start) = (self.stream(kind), self.group(kind), self.start_id(kind));

            match self.client.create_group(stream, group, start).await? {
                GroupCreation::Created => {
                    info!(stream, group, start, "created consumer group")
                }
                GroupCreation::AlreadyExists => info!(stream, group, "consumer group exists"),
            }
        }

        Ok(())
    }

    /// Rewind both groups to the start of their streams, to re-read everything.
    pub async fn reset_to_zero(&self) -> StreamResult<()> {
        for kind in [StreamKind::Records, StreamKind::Completions] {
            self.client
                .set_group_id(self.stream(kind), self.group(kind), "0-0")
                .await?;
        }
        warn!("rewound records and completions groups to 0-0");

        Ok(())
    }

    /// Log the length, last id and groups of both streams. Failures are only logged.
    pub async fn describe(&self, phase: &str) {
        for kind in [StreamKind::Records, StreamKind::Completions] {
            let stream = self.stream(kind);
            match self.client.summary(stream).await {
                Ok(StreamSummary {
                    length,
                    last_generated_id,
                    groups,
                }) => {
                    info!(phase, stream, length, last_id = %last_generated_id, "stream info");
                    for group in groups {
                        info!(
                            phase,
                            stream,
                            group = %group.name,
                            consumers = group.consumers,
                            pending = group.pending,
                            last_delivered = %group.last_delivered_id,
                            "group info"
                        );
                    }
                }
                Err(e) => warn!(phase, stream, "failed to describe stream: {}", e),
            }
        }
    }

    async fn read(
        &self,
        kind: StreamKind,
        count: usize,
        block: time::Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        self.client
            .read_group(
                self.stream(kind),
                self.group(kind),
                &self.config.consumer,
                count,
                block,
            )
            .await
    }

    pub async fn poll_completions(
        &self,
        count: usize,
        block: time::Duration,
    ) -> StreamResult<Vec<Decoded<CompletionSentinel>>> {
        let entries = self.read(StreamKind::Completions, count, block).await?;

        Ok(entries
            .into_iter()
            .map(|entry| Decoded {
                value: CompletionSentinel::decode(&entry),
                entry,
            })
            .collect())
    }

    pub async fn poll_records(
        &self,
        count: usize,
        block: time::Duration,
    ) -> StreamResult<Vec<Decoded<RecordBatch>>> {
        let entries = self.read(StreamKind::Records, count, block).await?;

        Ok(entries
            .into_iter()
            .map(|entry| Decoded {
                value: RecordBatch::decode(&entry),
                entry,
            })
            .collect())
    }

    /// Acknowledge entries of `kind`. Callers must have durably handled every id first.
    pub async fn ack(&self, kind: StreamKind, ids: &[String]) -> StreamResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.client
            .ack(self.stream(kind), self.group(kind), ids)
            .await
    }

    pub async fn delete(&self, kind: StreamKind, ids: &[String]) -> StreamResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.client.delete(self.stream(kind), ids).await
    }

    pub async fn pending_count(&self, kind: StreamKind) -> StreamResult<u64> {
        self.client
            .pending(self.stream(kind), self.group(kind))
            .await
    }

    pub async fn pending_counts(&self) -> StreamResult<PendingCounts> {
        Ok(PendingCounts {
            records: self.pending_count(StreamKind::Records).await?,
            completions: self.pending_count(StreamKind::Completions).await?,
        })
    }

    pub async fn dead_letter(&self, letter: &DeadLetter) -> StreamResult<String> {
        self.client
            .append(&self.config.dead_letter, &letter.to_fields(), None)
            .await
    }

    /// Approximately trim both streams. Failures are only logged.
    pub async fn trim(&self, keep_records: usize, keep_completions: usize) {
        for (kind, keep) in [
            (StreamKind::Records, keep_records),
            (StreamKind::Completions, keep_completions),
        ] {
            let stream = self.stream(kind);
            match self.client.trim(stream, keep).await {
                Ok(evicted) => info!(stream, keep, evicted, "trimmed stream"),
                Err(e) => warn!(stream, "failed to trim stream: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;
    use stream_common::mock::{MockStreamCall, MockStreamClient};

    use super::*;

    fn consumer(client: MockStreamClient) -> StreamConsumer<MockStreamClient> {
        let config = StreamConfig::init_from_hashmap(&HashMap::new()).unwrap();
        StreamConsumer::new(client, config)
    }

    #[tokio::test]
    async fn test_ensure_groups_is_idempotent() {
        let client = MockStreamClient::new();
        let consumer = consumer(client.clone());

        consumer.ensure_groups().await.unwrap();
        consumer.ensure_groups().await.unwrap();

        let creations = client
            .get_calls()
            .into_iter()
            .filter(|call| matches!(call, MockStreamCall::CreateGroup { .. }))
            .count();
        assert_eq!(creations, 4);
        assert_eq!(consumer.pending_counts().await.unwrap(), PendingCounts::default());
    }

    #[tokio::test]
    async fn test_poll_decodes_and_ack_clears_pending() {
        let client = MockStreamClient::new();
        let consumer = consumer(client.clone());
        consumer.ensure_groups().await.unwrap();

        client.seed(
            "crawl:completed",
            &[("batch_id", "B1"), ("source", "toss"), ("row_count", "2")],
        );
        client.seed("crawl:completed", &[("source", "toss")]);

        let polled = consumer
            .poll_completions(100, time::Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].value.as_ref().unwrap().expected_count, 2);
        assert!(polled[1].value.is_err());

        assert_eq!(consumer.pending_count(StreamKind::Completions).await.unwrap(), 2);
        let ids: Vec<String> = polled.iter().map(|d| d.id().to_owned()).collect();
        assert_eq!(consumer.ack(StreamKind::Completions, &ids).await.unwrap(), 2);
        assert_eq!(consumer.pending_count(StreamKind::Completions).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_to_zero_replays() {
        let client = MockStreamClient::new();
        let consumer = consumer(client.clone());
        consumer.ensure_groups().await.unwrap();
        client.seed("crawl:records", &[("batch_id", "B1"), ("records", "[]")]);

        let first = consumer.poll_records(10, time::Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(consumer
            .poll_records(10, time::Duration::ZERO)
            .await
            .unwrap()
            .is_empty());

        consumer.reset_to_zero().await.unwrap();
        let replayed = consumer.poll_records(10, time::Duration::ZERO).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id(), first[0].id());
    }

    #[tokio::test]
    async fn test_delete_and_trim() {
        let client = MockStreamClient::new();
        let consumer = consumer(client.clone());
        consumer.ensure_groups().await.unwrap();
        let first = client.seed("crawl:records", &[("n", "1")]);
        client.seed("crawl:records", &[("n", "2")]);
        client.seed("crawl:records", &[("n", "3")]);

        assert_eq!(consumer.delete(StreamKind::Records, &[first]).await.unwrap(), 1);
        consumer.trim(1, 0).await;

        assert_eq!(client.entries("crawl:records").len(), 1);
        assert_eq!(client.entries("crawl:records")[0].get("n"), Some("3"));
    }
}
