use stream_common::streams::DeadLetter;
use tracing::{debug, error};

use crate::companies::CompanyDirectory;
use crate::decode::{Decoded, RecordBatch};
use crate::progress::ProgressKey;
use crate::store::{NewsRow, NewsStore};

/// Result of a record entry that was written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Progress key, when the entry carried both a batch id and a source.
    pub key: Option<ProgressKey>,
    /// Url-bearing records written: inserted plus updated.
    pub written: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Records dropped for lacking a url.
    pub without_url: u64,
}

/// What became of a single record entry. Every variant can be acknowledged, but a
/// `DeadLetter` must first be appended to the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Nothing to write.
    Skipped,
    Applied(AppliedBatch),
    DeadLetter(DeadLetter),
}

/// Applies decoded record batches to a `NewsStore`.
pub struct RecordProcessor<S> {
    store: S,
    companies: CompanyDirectory,
    records_stream: String,
}

impl<S: NewsStore> RecordProcessor<S> {
    pub fn new(store: S, companies: CompanyDirectory, records_stream: &str) -> Self {
        Self {
            store,
            companies,
            records_stream: records_stream.to_owned(),
        }
    }

    /// Write one entry in a single store transaction. Never fails: errors become dead letters.
    pub async fn process(&self, delivery: &Decoded<RecordBatch>) -> EntryOutcome {
        let batch = match &delivery.value {
            Ok(batch) => batch,
            Err(e) => {
                error!(id = %delivery.entry.id, "failed to decode record entry: {}", e);
                return self.dead_letter(delivery, &e.to_string());
            }
        };

        if batch.is_empty() {
            debug!(id = %delivery.entry.id, "skipping record entry without records");
            return EntryOutcome::Skipped;
        }
        if let Some(declared) = batch.declared_count {
            if declared != batch.records.len() as u64 {
                debug!(
                    id = %delivery.entry.id,
                    declared,
                    decoded = batch.records.len(),
                    "record count does not match declared count"
                );
            }
        }

        let company = self
            .companies
            .resolve(batch.source.as_deref().unwrap_or_default());
        let rows: Vec<NewsRow> = batch.records.iter().filter_map(NewsRow::from_record).collect();
        let without_url = (batch.records.len() - rows.len()) as u64;

        match self.store.write_batch(&company, &rows).await {
            Ok(summary) => EntryOutcome::Applied(AppliedBatch {
                key: batch
                    .batch_id
                    .as_deref()
                    .zip(batch.source.as_deref())
                    .map(|(batch_id, source)| ProgressKey::new(batch_id, source)),
                written: summary.written(),
                inserted: summary.inserted,
                updated: summary.updated,
                without_url,
            }),
            Err(e) => {
                error!(id = %delivery.entry.id, company = %company.name, "failed to write record entry: {}", e);
                self.dead_letter(delivery, &e.to_string())
            }
        }
    }

    fn dead_letter(&self, delivery: &Decoded<RecordBatch>, reason: &str) -> EntryOutcome {
        EntryOutcome::DeadLetter(DeadLetter::new(&self.records_stream, &delivery.entry, reason))
    }
}
