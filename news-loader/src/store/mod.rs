use async_trait::async_trait;

use crate::companies::CompanyName;
use crate::decode::{normalize_published_at, RecordItem};
use crate::error::StoreError;

pub mod memory;
pub mod postgres;

/// A news row ready to be written, keyed by the company it belongs to and its url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsRow {
    pub url: String,
    pub title: Option<String>,
    /// A `YYYY-MM-DD` date when the producer sent an ISO-like timestamp.
    pub published_at: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl NewsRow {
    /// Records without a url cannot be keyed and are dropped.
    pub fn from_record(record: &RecordItem) -> Option<Self> {
        Some(Self {
            url: record.url()?.to_owned(),
            title: record.title.clone(),
            published_at: normalize_published_at(record.published_at.as_deref()),
            thumbnail_url: record.thumbnail_url.clone(),
        })
    }
}

/// Counts of a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    pub company_id: i64,
    pub inserted: u64,
    pub updated: u64,
}

impl WriteSummary {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// The relational store news are loaded into.
#[async_trait]
pub trait NewsStore: Send + Sync {
    /// Upsert `company`, then upsert every row under it keyed on (company, url).
    ///
    /// All writes commit together or not at all. For every row an UPDATE is attempted first
    /// and an INSERT follows only when the UPDATE matched nothing.
    async fn write_batch(
        &self,
        company: &CompanyName,
        rows: &[NewsRow],
    ) -> Result<WriteSummary, StoreError>;
}
