use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use crate::entities::{EntityError, EvaluationStore};
use crate::model::{Evaluation, SyncStatus, normalize_email};
use crate::remote::{RemoteError, RemoteStore};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to persist sync results: {0}")]
    Persist(#[from] EntityError),
}

/// Why a single record was not pushed.
#[derive(Debug, Error)]
enum PushFailure {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Attempts per record, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl SyncPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::new(base_delay, max_delay, true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    NothingToSync,
    Complete,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub success_count: usize,
    pub failure_count: usize,
    /// Records left untouched because the run was cancelled, including one
    /// interrupted while backing off.
    pub skipped: usize,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn outcome(&self) -> SyncOutcome {
        match (self.success_count, self.failure_count) {
            (0, 0) => SyncOutcome::NothingToSync,
            (_, 0) => SyncOutcome::Complete,
            (0, _) => SyncOutcome::Failed,
            _ => SyncOutcome::Partial,
        }
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} succeeded, {} failed",
            self.success_count, self.failure_count
        );
        if self.cancelled {
            line.push_str(&format!(" (cancelled, {} skipped)", self.skipped));
        }
        line
    }
}

/// Pushes pending evaluations one at a time, retrying transient failures.
pub struct SyncOrchestrator<'a, R> {
    remote: &'a R,
    evaluations: &'a EvaluationStore,
    policy: SyncPolicy,
}

impl<'a, R: RemoteStore> SyncOrchestrator<'a, R> {
    pub fn new(remote: &'a R, evaluations: &'a EvaluationStore, policy: SyncPolicy) -> Self {
        Self {
            remote,
            evaluations,
            policy,
        }
    }

    /// Syncs every pending record in `records`, updating statuses in place.
    /// Records are processed in order and cancellation is honored between
    /// them. All records are persisted locally in one batch at the end,
    /// cancelled or not.
    pub async fn sync_all(
        &self,
        login: &str,
        records: &mut [Evaluation],
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let login = normalize_email(login);
        let mut report = SyncReport::default();

        for record in records.iter_mut() {
            if record.sync_status == SyncStatus::Synced {
                continue;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped += 1;
                continue;
            }

            match self.push_with_retry(&login, record, cancel).await {
                Ok(()) => {
                    record.sync_status = SyncStatus::Synced;
                    report.success_count += 1;
                }
                Err(PushFailure::Cancelled) => {
                    debug!(id = %record.id, "sync cancelled during retry backoff");
                    report.cancelled = true;
                    report.skipped += 1;
                }
                Err(PushFailure::Remote(err)) => {
                    warn!(id = %record.id, error = %err, "evaluation failed to sync");
                    record.sync_status = SyncStatus::Error;
                    report.failure_count += 1;
                }
            }
        }

        self.evaluations.save_all(records).await?;
        info!(
            login = %login,
            succeeded = report.success_count,
            failed = report.failure_count,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "sync finished"
        );
        Ok(report)
    }

    async fn push_with_retry(
        &self,
        login: &str,
        record: &Evaluation,
        cancel: &CancellationToken,
    ) -> Result<(), PushFailure> {
        let mut attempt = 0u32;
        loop {
            let err = match self.remote.save_evaluation(login, record).await {
                Ok(outcome) if outcome.success => return Ok(()),
                Ok(outcome) => {
                    return Err(RemoteError::NotConfigured(outcome.message).into());
                }
                Err(err) => err,
            };

            attempt += 1;
            if err.is_configuration() || !err.is_retryable() || attempt >= self.policy.max_attempts {
                return Err(err.into());
            }

            let delay = self.policy.backoff.delay(attempt - 1);
            debug!(id = %record.id, attempt, ?delay, error = %err, "retrying evaluation sync");
            tokio::select! {
                _ = cancel.cancelled() => return Err(PushFailure::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
