use std::collections::BTreeSet;
use std::future::Future;
use std::time;

use stream_common::health::HealthHandle;
use stream_common::streams::StreamClient;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::completion::CompletionTracker;
use crate::consumer::{StreamConsumer, StreamKind};
use crate::error::LoaderError;
use crate::processor::{EntryOutcome, RecordProcessor};
use crate::progress::Progress;
use crate::shutdown::{Decision, ExitReason, LoaderState, ShutdownController};
use crate::store::NewsStore;

/// Tunables of the loader loop.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub batch: usize,
    pub block: time::Duration,
    pub completions_batch: usize,
    pub completions_block: time::Duration,
    pub quiet: time::Duration,
    pub max_run: time::Duration,
    pub reset_to_zero: bool,
    pub delete_records: bool,
    pub delete_sentinels: bool,
    pub trim_on_exit: bool,
    pub keep_last_records: usize,
    pub keep_last_completed: usize,
    pub required_sources: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub inserted: u64,
    pub updated: u64,
    pub acked_records: u64,
    pub acked_completions: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub exit_reason: ExitReason,
    pub totals: RunTotals,
}

/// Counts of one records poll, for logging.
#[derive(Debug, Default)]
struct BatchTally {
    rows: u64,
    inserted: u64,
    updated: u64,
    skipped: u64,
    dead_lettered: u64,
}

/// Consumes the completions and records streams until the shutdown controller says stop.
pub struct Loader<C, S> {
    consumer: StreamConsumer<C>,
    processor: RecordProcessor<S>,
    settings: LoaderSettings,
    progress: Progress,
    tracker: CompletionTracker,
    controller: ShutdownController,
    totals: RunTotals,
    /// Last time a sentinel decoded or a record entry was delivered.
    last_activity: Instant,
    liveness: Option<HealthHandle>,
}

impl<C: StreamClient, S: NewsStore> Loader<C, S> {
    pub fn new(
        consumer: StreamConsumer<C>,
        processor: RecordProcessor<S>,
        settings: LoaderSettings,
    ) -> Self {
        let now = Instant::now();
        let controller = ShutdownController::new(
            settings.quiet,
            settings.max_run,
            settings.required_sources.clone(),
            now,
        );

        Self {
            consumer,
            processor,
            settings,
            progress: Progress::default(),
            tracker: CompletionTracker::default(),
            controller,
            totals: RunTotals::default(),
            last_activity: now,
            liveness: None,
        }
    }

    /// Report healthy to `liveness` on every loop iteration.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn state(&self) -> LoaderState {
        self.controller.state()
    }

    pub fn totals(&self) -> &RunTotals {
        &self.totals
    }

    /// Prepare groups and log the state of both streams.
    pub async fn start(&mut self) -> Result<(), LoaderError> {
        self.consumer.ensure_groups().await?;
        if self.settings.reset_to_zero {
            self.consumer.reset_to_zero().await?;
        }
        self.consumer.describe("start").await;

        if !self.settings.required_sources.is_empty() {
            info!(required_sources = ?self.settings.required_sources, "waiting for required sources");
        }

        Ok(())
    }

    /// Run one iteration: absorb sentinels, process one records poll, then decide whether to stop.
    pub async fn step(&mut self) -> Result<Decision, LoaderError> {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }

        self.absorb_completions().await?;
        self.process_records().await?;

        self.check_exit().await
    }

    /// Run until drained, until the run time cap, or until `shutdown` resolves.
    /// The run time cap also cuts short a step stuck on the streams or the store.
    /// Exit hooks run however the loop ends.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunSummary, LoaderError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        tokio::pin!(shutdown);
        let deadline = self.controller.deadline();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown requested, stopping");
                    self.controller.stop(ExitReason::Signal);
                    break Ok(ExitReason::Signal);
                }

                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        max_run_secs = self.settings.max_run.as_secs(),
                        "maximum run time reached during a step, forcing exit"
                    );
                    self.controller.stop(ExitReason::MaxRunReached);
                    break Ok(ExitReason::MaxRunReached);
                }

                decision = self.step() => match decision {
                    Ok(Decision::Stop(reason)) => break Ok(reason),
                    Ok(_) => continue,
                    Err(e) => break Err(e),
                },
            }
        };

        self.finish(&outcome).await;

        Ok(RunSummary {
            exit_reason: outcome?,
            totals: self.totals.clone(),
        })
    }

    async fn absorb_completions(&mut self) -> Result<(), LoaderError> {
        let deliveries = self
            .consumer
            .poll_completions(
                self.settings.completions_batch,
                self.settings.completions_block,
            )
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }

        let absorbed = self.tracker.absorb(&mut self.progress, deliveries);
        if absorbed.observed > 0 {
            self.last_activity = Instant::now();
        }

        // Sentinels are acknowledged whether they decoded or not.
        self.consumer
            .ack(StreamKind::Completions, &absorbed.ids)
            .await?;
        self.totals.acked_completions += absorbed.ids.len() as u64;

        if self.settings.delete_sentinels {
            let deleted = self
                .consumer
                .delete(StreamKind::Completions, &absorbed.ids)
                .await?;
            debug!(deleted, "deleted acknowledged sentinels");
        }

        Ok(())
    }

    async fn process_records(&mut self) -> Result<(), LoaderError> {
        let deliveries = self
            .consumer
            .poll_records(self.settings.batch, self.settings.block)
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }
        self.last_activity = Instant::now();

        let mut tally = BatchTally::default();
        let mut ack_ids = Vec::with_capacity(deliveries.len());

        for delivery in deliveries.iter() {
            let started = Instant::now();
            let outcome = self.processor.process(delivery).await;

            let label = match outcome {
                EntryOutcome::Skipped => {
                    tally.skipped += 1;
                    ack_ids.push(delivery.entry.id.clone());
                    "skipped"
                }
                EntryOutcome::Applied(applied) => {
                    if let Some(key) = applied.key {
                        self.progress.record_done(key, applied.written);
                    }
                    tally.rows += applied.written;
                    tally.inserted += applied.inserted;
                    tally.updated += applied.updated;
                    ack_ids.push(delivery.entry.id.clone());
                    "applied"
                }
                EntryOutcome::DeadLetter(letter) => {
                    match self.consumer.dead_letter(&letter).await {
                        Ok(dead_letter_id) => {
                            warn!(
                                id = %letter.origin_id,
                                dead_letter_id = %dead_letter_id,
                                reason = %letter.reason,
                                "moved record entry to dead-letter stream"
                            );
                            tally.dead_lettered += 1;
                            ack_ids.push(delivery.entry.id.clone());
                            "dead_letter"
                        }
                        Err(e) => {
                            // Not acknowledged, the entry stays pending.
                            error!(id = %letter.origin_id, "failed to dead-letter entry, leaving it unacknowledged: {}", e);
                            "unacknowledged"
                        }
                    }
                }
            };

            let labels = [("outcome", label.to_owned())];
            metrics::counter!("news_loader_record_entries_total", &labels).increment(1);
            metrics::histogram!("news_loader_record_entry_duration_ms", &labels)
                .record(started.elapsed().as_millis() as f64);
        }

        self.consumer.ack(StreamKind::Records, &ack_ids).await?;
        if self.settings.delete_records {
            let deleted = self.consumer.delete(StreamKind::Records, &ack_ids).await?;
            debug!(deleted, "deleted acknowledged record entries");
        }

        self.totals.inserted += tally.inserted;
        self.totals.updated += tally.updated;
        self.totals.acked_records += ack_ids.len() as u64;
        self.totals.dead_lettered += tally.dead_lettered;
        metrics::counter!("news_loader_rows_inserted_total").increment(tally.inserted);
        metrics::counter!("news_loader_rows_updated_total").increment(tally.updated);

        info!(
            read = deliveries.len(),
            rows = tally.rows,
            inserted = tally.inserted,
            updated = tally.updated,
            skipped = tally.skipped,
            dead_lettered = tally.dead_lettered,
            ack = ack_ids.len(),
            "processed record entries"
        );
        info!(progress = %self.progress, "progress");

        Ok(())
    }

    async fn check_exit(&mut self) -> Result<Decision, LoaderError> {
        let decision = self
            .controller
            .evaluate(&self.progress, self.last_activity, Instant::now());

        let Decision::CheckPending(candidate) = decision else {
            return Ok(decision);
        };

        let pending = match self.consumer.pending_counts().await {
            Ok(counts) => {
                info!(
                    candidate = %candidate,
                    records = counts.records,
                    completions = counts.completions,
                    "quiet period elapsed, checking pending entries"
                );
                Some(counts)
            }
            Err(e) => {
                warn!("failed to check pending entries, stopping anyway: {}", e);
                None
            }
        };

        Ok(self.controller.settle(candidate, pending))
    }

    async fn finish(&mut self, outcome: &Result<ExitReason, LoaderError>) {
        self.consumer.describe("exit").await;

        if self.settings.trim_on_exit {
            self.consumer
                .trim(
                    self.settings.keep_last_records,
                    self.settings.keep_last_completed,
                )
                .await;
        }

        let totals = &self.totals;
        match outcome {
            Ok(reason) => info!(
                exit_reason = %reason,
                inserted = totals.inserted,
                updated = totals.updated,
                acked_records = totals.acked_records,
                acked_completions = totals.acked_completions,
                dead_lettered = totals.dead_lettered,
                "loader finished"
            ),
            Err(e) => error!(
                inserted = totals.inserted,
                updated = totals.updated,
                acked_records = totals.acked_records,
                acked_completions = totals.acked_completions,
                dead_lettered = totals.dead_lettered,
                "loader failed: {}",
                e
            ),
        }
    }
}
