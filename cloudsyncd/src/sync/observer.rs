use async_trait::async_trait;

use super::conflict::Resolution;
use super::discovery::{Change, ChangeKind};
use super::engine::RunSummary;
use super::job::{Job, JobState};

/// Hooks a front-end uses to follow a run. Every method defaults to a no-op.
#[async_trait]
pub trait SyncObserver: Send + Sync {
    fn change_discovered(&self, _change: &Change) {}

    fn job_started(&self, _job: &Job) {}

    /// `done` of `total` bytes moved for the job at `path`.
    fn job_progress(&self, _path: &str, _done: u64, _total: u64) {}

    fn job_finished(&self, _job: &Job) {}

    fn run_finished(&self, _summary: &RunSummary) {}

    /// Asked for conflicts the policy leaves to the user. `None` leaves the
    /// conflict pending until the next run.
    async fn resolve_conflict(
        &self,
        _change: &Change,
        _suggestion: Option<&str>,
    ) -> Option<Resolution> {
        None
    }
}

pub struct NullObserver;

#[async_trait]
impl SyncObserver for NullObserver {}

/// Reports everything through `tracing`.
pub struct LoggingObserver;

#[async_trait]
impl SyncObserver for LoggingObserver {
    fn change_discovered(&self, change: &Change) {
        if !matches!(change.kind, ChangeKind::Unchanged) {
            tracing::debug!(path = %change.path, kind = ?change.kind, "change discovered");
        }
    }

    fn job_started(&self, job: &Job) {
        tracing::debug!(id = job.id, path = %job.path, kind = job.kind.name(), "job started");
    }

    fn job_finished(&self, job: &Job) {
        match &job.state {
            JobState::Done => {
                tracing::info!(path = %job.path, kind = job.kind.name(), "synced")
            }
            JobState::Failed(kind) => {
                tracing::warn!(path = %job.path, kind = job.kind.name(), failure = %kind, "job failed")
            }
            JobState::Skipped(reason) => {
                tracing::info!(path = %job.path, kind = job.kind.name(), %reason, "job skipped")
            }
            JobState::Pending | JobState::Running => {}
        }
    }

    fn run_finished(&self, summary: &RunSummary) {
        tracing::info!(
            synced = summary.synced,
            failed = summary.failed,
            conflicted = summary.conflicted,
            skipped = summary.skipped,
            bytes_up = summary.bytes_up,
            bytes_down = summary.bytes_down,
            needs_followup = summary.needs_followup,
            "sync run finished"
        );
    }

    async fn resolve_conflict(&self, change: &Change, suggestion: Option<&str>) -> Option<Resolution> {
        tracing::warn!(path = %change.path, ?suggestion, "conflict needs a decision");
        None
    }
}
