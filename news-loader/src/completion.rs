use tracing::{info, warn};

use crate::decode::{CompletionSentinel, Decoded};
use crate::progress::{Progress, ProgressKey};

/// What one poll of the completions stream contributed.
#[derive(Debug, Default)]
pub struct Absorbed {
    /// Every delivered id, well-formed or not. All of them are acknowledged.
    pub ids: Vec<String>,
    /// Number of sentinels that decoded, which counts as activity.
    pub observed: usize,
}

/// Folds completion sentinels into the expected side of the progress table.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    pub sentinels_seen: u64,
    pub malformed: u64,
}

impl CompletionTracker {
    pub fn absorb(
        &mut self,
        progress: &mut Progress,
        deliveries: Vec<Decoded<CompletionSentinel>>,
    ) -> Absorbed {
        let mut absorbed = Absorbed::default();

        for Decoded { entry, value } in deliveries {
            match value {
                Ok(sentinel) => {
                    let key = ProgressKey::new(&sentinel.batch_id, &sentinel.source);
                    progress.expect(key, sentinel.expected_count);
                    self.sentinels_seen += 1;
                    absorbed.observed += 1;
                    metrics::counter!("news_loader_sentinels_total").increment(1);

                    info!(
                        batch_id = %sentinel.batch_id,
                        source = %sentinel.source,
                        expected = sentinel.expected_count,
                        batches = progress.expected().len(),
                        "sentinel observed"
                    );
                }
                Err(e) => {
                    self.malformed += 1;
                    metrics::counter!("news_loader_sentinels_malformed_total").increment(1);
                    warn!(id = %entry.id, "dropping malformed sentinel: {}", e);
                }
            }
            absorbed.ids.push(entry.id);
        }

        absorbed
    }
}
