//! Decides, once per loop iteration, whether the loader has drained its streams.
use std::collections::BTreeSet;
use std::fmt;
use std::time;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::consumer::PendingCounts;
use crate::progress::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Every announced batch was written, the streams were quiet and nothing is pending.
    Drained,
    /// No sentinel ever arrived, the streams were quiet and nothing is pending.
    QuietWithoutSentinels,
    MaxRunReached,
    /// A quiet exit was due but pending counts could not be read.
    PendingCheckFailed,
    Signal,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ExitReason::Drained => "drained",
            ExitReason::QuietWithoutSentinels => "quiet_without_sentinels",
            ExitReason::MaxRunReached => "max_run_reached",
            ExitReason::PendingCheckFailed => "pending_check_failed",
            ExitReason::Signal => "signal",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Running,
    /// Every announced batch is done; waiting for quiet streams with nothing pending.
    Draining,
    Stopped(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    /// Stop with the given reason if both pending counts are zero.
    CheckPending(ExitReason),
    Stop(ExitReason),
}

pub struct ShutdownController {
    quiet: time::Duration,
    max_run: time::Duration,
    required_sources: BTreeSet<String>,
    started_at: Instant,
    state: LoaderState,
}

impl ShutdownController {
    pub fn new(
        quiet: time::Duration,
        max_run: time::Duration,
        required_sources: BTreeSet<String>,
        started_at: Instant,
    ) -> Self {
        Self {
            quiet,
            max_run,
            required_sources,
            started_at,
            state: LoaderState::Running,
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// The instant the maximum run time is up.
    pub fn deadline(&self) -> Instant {
        self.started_at + self.max_run
    }

    /// True when at least one batch was announced, every announced batch is written, and
    /// every required source announced a batch.
    pub fn all_finished(&self, progress: &Progress) -> bool {
        if progress.is_empty() {
            return false;
        }

        let sources = progress.sources();
        if !self
            .required_sources
            .iter()
            .all(|required| sources.contains(required.as_str()))
        {
            return false;
        }

        progress.all_done()
    }

    pub fn evaluate(&mut self, progress: &Progress, last_activity: Instant, now: Instant) -> Decision {
        if let LoaderState::Stopped(reason) = self.state {
            return Decision::Stop(reason);
        }

        if now.duration_since(self.started_at) >= self.max_run {
            warn!(
                max_run_secs = self.max_run.as_secs(),
                "maximum run time reached, forcing exit"
            );
            return self.stop(ExitReason::MaxRunReached);
        }

        let finished = self.all_finished(progress);
        // A late sentinel can push a draining loader back to running.
        self.state = if finished {
            LoaderState::Draining
        } else {
            LoaderState::Running
        };

        let quiet = now.duration_since(last_activity) >= self.quiet;
        match (finished, quiet) {
            (true, true) => Decision::CheckPending(ExitReason::Drained),
            (false, true) if progress.is_empty() => {
                Decision::CheckPending(ExitReason::QuietWithoutSentinels)
            }
            _ => Decision::Continue,
        }
    }

    /// Resolve a `CheckPending` decision. `pending` is `None` when the lookup failed, which
    /// ends the run as the streams were quiet anyway.
    pub fn settle(
        &mut self,
        candidate: ExitReason,
        pending: Option<PendingCounts>,
    ) -> Decision {
        match pending {
            None => self.stop(ExitReason::PendingCheckFailed),
            Some(counts) if counts.is_zero() => self.stop(candidate),
            Some(counts) => {
                info!(
                    records = counts.records,
                    completions = counts.completions,
                    "quiet but entries still pending"
                );
                Decision::Continue
            }
        }
    }

    pub fn stop(&mut self, reason: ExitReason) -> Decision {
        self.state = LoaderState::Stopped(reason);
        Decision::Stop(reason)
    }
}
