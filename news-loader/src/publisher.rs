use stream_common::streams::StreamClient;

use crate::decode::RecordItem;
use crate::error::LoaderError;

pub const RECORDS_MAX_LEN: usize = 20_000;
pub const COMPLETIONS_MAX_LEN: usize = 10_000;

/// Producer side of the streams: publishes record chunks and the sentinel that closes a batch.
pub struct Publisher<C> {
    client: C,
    records_stream: String,
    completions_stream: String,
    chunk_size: usize,
}

impl<C: StreamClient> Publisher<C> {
    pub fn new(client: C, records_stream: &str, completions_stream: &str, chunk_size: usize) -> Self {
        Self {
            client,
            records_stream: records_stream.to_owned(),
            completions_stream: completions_stream.to_owned(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Publish `records` as entries of at most `chunk_size` records each.
    /// Returns the number of entries appended.
    pub async fn publish_records(
        &self,
        source: &str,
        batch_id: &str,
        records: &[RecordItem],
    ) -> Result<usize, LoaderError> {
        let mut sent = 0;

        for chunk in records.chunks(self.chunk_size) {
            let fields = vec![
                ("source".to_owned(), source.to_owned()),
                ("batch_id".to_owned(), batch_id.to_owned()),
                ("schema".to_owned(), "v1".to_owned()),
                ("count".to_owned(), chunk.len().to_string()),
                ("records".to_owned(), serde_json::to_string(chunk)?),
            ];
            self.client
                .append(&self.records_stream, &fields, Some(RECORDS_MAX_LEN))
                .await?;
            sent += 1;
        }

        Ok(sent)
    }

    /// Announce that `row_count` records were published for (`batch_id`, `source`).
    pub async fn publish_completion(
        &self,
        source: &str,
        batch_id: &str,
        row_count: u64,
    ) -> Result<String, LoaderError> {
        let fields = [
            ("source".to_owned(), source.to_owned()),
            ("batch_id".to_owned(), batch_id.to_owned()),
            ("row_count".to_owned(), row_count.to_string()),
        ];

        Ok(self
            .client
            .append(&self.completions_stream, &fields, Some(COMPLETIONS_MAX_LEN))
            .await?)
    }
}
