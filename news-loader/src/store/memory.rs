use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::companies::CompanyName;
use crate::error::StoreError;
use crate::store::{NewsRow, NewsStore, WriteSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCompany {
    pub id: i64,
    pub name: String,
    pub name_kr: Option<String>,
}

#[derive(Default, Clone)]
struct MemoryState {
    companies: Vec<StoredCompany>,
    news: BTreeMap<(i64, String), NewsRow>,
}

/// A `NewsStore` held in memory, with the same upsert and atomicity rules as PostgreSQL.
#[derive(Clone, Default)]
pub struct MemoryNewsStore {
    state: Arc<Mutex<MemoryState>>,
    failing_urls: Arc<Mutex<HashSet<String>>>,
}

impl MemoryNewsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every batch containing `url` fail, as a constraint violation would.
    pub fn fail_on_url(&mut self, url: &str) -> Self {
        match self.failing_urls.lock() {
            Ok(mut urls) => urls.insert(url.to_owned()),
            Err(poisoned) => poisoned.into_inner().insert(url.to_owned()),
        };
        self.clone()
    }

    fn fails_on(&self, url: &str) -> bool {
        match self.failing_urls.lock() {
            Ok(urls) => urls.contains(url),
            Err(poisoned) => poisoned.into_inner().contains(url),
        }
    }

    pub fn companies(&self) -> Vec<StoredCompany> {
        self.lock_state().companies.clone()
    }

    /// Stored news of `company`, ordered by url.
    pub fn news(&self, company: &str) -> Vec<NewsRow> {
        let state = self.lock_state();
        let Some(id) = state
            .companies
            .iter()
            .find(|c| c.name == company)
            .map(|c| c.id)
        else {
            return Vec::new();
        };

        state
            .news
            .iter()
            .filter(|((company_id, _), _)| *company_id == id)
            .map(|(_, row)| row.clone())
            .collect()
    }
}

impl MemoryState {
    fn upsert_company(&mut self, company: &CompanyName) -> i64 {
        let name_kr = Some(company.name_kr.clone()).filter(|n| !n.is_empty());

        if let Some(existing) = self.companies.iter_mut().find(|c| c.name == company.name) {
            if name_kr.is_some() {
                existing.name_kr = name_kr;
            }
            return existing.id;
        }

        let id = self.companies.len() as i64 + 1;
        self.companies.push(StoredCompany {
            id,
            name: company.name.clone(),
            name_kr,
        });
        id
    }
}

#[async_trait]
impl NewsStore for MemoryNewsStore {
    async fn write_batch(
        &self,
        company: &CompanyName,
        rows: &[NewsRow],
    ) -> Result<WriteSummary, StoreError> {
        let mut state = self.lock_state();
        // Work on a copy, committed only once every row went through.
        let mut tx = state.clone();

        let company_id = tx.upsert_company(company);
        let mut summary = WriteSummary {
            company_id,
            ..Default::default()
        };

        for row in rows {
            if self.fails_on(&row.url) {
                return Err(StoreError::QueryError {
                    command: "INSERT".to_owned(),
                    error: sqlx::Error::Protocol(format!("injected failure for {}", row.url)),
                });
            }

            let key = (company_id, row.url.clone());
            if tx.news.insert(key, row.clone()).is_some() {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }

        *state = tx;
        Ok(summary)
    }
}
