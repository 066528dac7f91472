use std::path::PathBuf;
use std::sync::Arc;

use cloudsync_core::RemoteError;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::conflict::{ConflictPolicy, ConflictResolver, conflict_stamp};
use super::discovery::{DiscoveryOptions, RenameDetection, discover};
use super::exclude::{ExcludeError, ExclusionList};
use super::job::JobState;
use super::journal::{FailureRecord, Journal, JournalError, now_unix};
use super::local_walker::{LocalWalker, WalkError};
use super::names::NameRules;
use super::observer::{NullObserver, SyncObserver};
use super::planner::{PlanOptions, Planner};
use super::propagator::{Propagator, PropagatorConfig};
use super::remote::RemoteStore;
use super::remote_walker::walk_remote;
use super::transfer::{FreeSpace, StatvfsSpace, TransferClient, TransferConfig};
use super::vfs::VfsMode;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("local walk failed: {0}")]
    Walk(#[from] WalkError),
    #[error("remote walk failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("invalid exclusion list: {0}")]
    Exclude(#[from] ExcludeError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub parallelism: usize,
    pub transfer: TransferConfig,
    pub vfs: VfsMode,
    pub rename_detection: RenameDetection,
    pub case_insensitive: bool,
    pub conflict_policy: ConflictPolicy,
    pub name_rules: NameRules,
    pub move_to_trash: bool,
    pub free_space_margin: u64,
    /// Upload conflict copies; when off they stay local and are ignored.
    pub upload_conflict_copies: bool,
    pub retry: RetryPolicy,
    pub exclude_patterns: Vec<String>,
    pub ignore_file: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let propagation = PropagatorConfig::default();
        Self {
            parallelism: propagation.parallelism,
            transfer: TransferConfig::default(),
            vfs: VfsMode::Off,
            rename_detection: RenameDetection::default(),
            case_insensitive: DiscoveryOptions::default().case_insensitive,
            conflict_policy: ConflictPolicy::default(),
            name_rules: NameRules::default(),
            move_to_trash: propagation.move_to_trash,
            free_space_margin: propagation.free_space_margin,
            upload_conflict_copies: true,
            retry: RetryPolicy::default(),
            exclude_patterns: Vec::new(),
            ignore_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub synced: usize,
    pub failed: usize,
    pub conflicted: usize,
    pub skipped: usize,
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Another run is needed to see everything this one changed.
    pub needs_followup: bool,
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    journal: Arc<Journal>,
    local_root: PathBuf,
    options: EngineOptions,
    observer: Arc<dyn SyncObserver>,
    space: Arc<dyn FreeSpace>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        journal: Arc<Journal>,
        local_root: impl Into<PathBuf>,
        options: EngineOptions,
    ) -> Self {
        Self {
            remote,
            journal,
            local_root: local_root.into(),
            options,
            observer: Arc::new(NullObserver),
            space: Arc::new(StatvfsSpace),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_free_space(mut self, space: Arc<dyn FreeSpace>) -> Self {
        self.space = space;
        self
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Exclusions in effect for a run: built-ins, configured patterns, the
    /// ignore file and the journal's selective-sync list.
    pub async fn exclusions(&self) -> Result<ExclusionList, EngineError> {
        let mut builder = ExclusionList::builder().patterns(self.options.exclude_patterns.iter().cloned());
        if let Some(path) = &self.options.ignore_file {
            builder = builder.ignore_file(path)?;
        }
        if !self.options.upload_conflict_copies {
            builder = builder.local_conflict_copies();
        }
        let selective = self.journal.selective_sync_list().await?;
        Ok(builder.selective_sync(selective).build()?)
    }

    /// One full sync run: discovery, planning, propagation and the batched
    /// blacklist write. Item failures are part of the summary; only
    /// run-level failures return an error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary, EngineError> {
        let started = now_unix();
        let retry = self.options.retry;
        let pruned = self
            .journal
            .prune_blacklist(started, retry.max_attempts, retry.max_age_secs())
            .await?;
        if pruned > 0 {
            tracing::debug!(pruned, "expired blacklist entries dropped");
        }

        let entries = self.journal.load_entries().await?;
        let pins = self.journal.load_pins().await?;
        let blacklist = self.journal.load_blacklist().await?;
        let exclusions = self.exclusions().await?;

        let walker = LocalWalker {
            root: self.local_root.clone(),
            exclusions: exclusions.clone(),
            algorithm: self.options.transfer.algorithm,
            vfs: self.options.vfs,
        };
        let baseline = entries.clone();
        let local_walk = tokio::task::spawn_blocking(move || walker.walk(&baseline));
        let remote_walk = walk_remote(self.remote.as_ref(), &exclusions);
        let (local, remote) = tokio::join!(local_walk, remote_walk);
        let local = local??;
        let remote = remote?;
        tracing::debug!(
            local = local.items.len(),
            remote = remote.len(),
            journal = entries.len(),
            "walked both replicas"
        );

        let changes = discover(
            &local,
            &remote,
            &entries,
            &DiscoveryOptions {
                rename_detection: self.options.rename_detection,
                case_insensitive: self.options.case_insensitive,
                name_rules: self.options.name_rules.clone(),
            },
        );
        for change in &changes {
            self.observer.change_discovered(change);
        }

        let plan_options = PlanOptions {
            local_root: self.local_root.clone(),
            vfs: self.options.vfs,
            pins,
            resolver: ConflictResolver::new(
                self.options.conflict_policy,
                self.options.name_rules.clone(),
            ),
            stamp: conflict_stamp(OffsetDateTime::now_utc()),
            case_insensitive: self.options.case_insensitive,
            upload_conflict_copies: self.options.upload_conflict_copies,
        };
        let plan = Planner::new(&plan_options, &blacklist, started).plan(&changes);
        tracing::info!(
            changes = changes.len(),
            jobs = plan.jobs.len(),
            unresolved = plan.unresolved.len(),
            "sync plan ready"
        );

        let transfers = TransferClient::new(
            self.remote.clone(),
            self.journal.clone(),
            self.local_root.clone(),
            self.options.transfer,
        );
        let propagator = Propagator::new(
            self.remote.clone(),
            self.journal.clone(),
            transfers,
            self.observer.clone(),
            self.space.clone(),
            Arc::new(plan_options),
            PropagatorConfig {
                parallelism: self.options.parallelism,
                move_to_trash: self.options.move_to_trash,
                free_space_margin: self.options.free_space_margin,
            },
        );
        let outcome = propagator.run(plan.jobs, cancel).await;

        let finished = now_unix();
        let previous = |path: &str| blacklist.get(path).map_or(0, |entry| entry.retry_count);
        let mut failures: Vec<FailureRecord> = outcome
            .failures
            .iter()
            .map(|failure| FailureRecord {
                path: failure.path.clone(),
                kind: failure.kind,
                reason: failure.reason.clone(),
                next_retry_at: (!failure.kind.waits_for_user()).then(|| {
                    retry.next_retry_at(finished, previous(&failure.path), failure.retry_after)
                }),
            })
            .collect();
        failures.extend(plan.unresolved.iter().map(|unresolved| FailureRecord {
            path: unresolved.path.clone(),
            kind: unresolved.kind,
            reason: unresolved.reason.clone(),
            next_retry_at: (!unresolved.kind.waits_for_user())
                .then(|| retry.next_retry_at(finished, previous(&unresolved.path), None)),
        }));
        self.journal.write_run_failures(&failures, finished).await?;

        let count = |pred: fn(&JobState) -> bool| outcome.jobs.iter().filter(|j| pred(&j.state)).count();
        let summary = RunSummary {
            synced: count(|state| *state == JobState::Done),
            failed: count(|state| matches!(state, JobState::Failed(_))) + plan.unresolved.len(),
            conflicted: changes
                .iter()
                .filter(|change| change.conflict_kind().is_some())
                .count(),
            skipped: count(|state| matches!(state, JobState::Skipped(_))),
            bytes_up: outcome.bytes_up,
            bytes_down: outcome.bytes_down,
            needs_followup: plan.needs_followup || outcome.needs_followup,
        };
        self.observer.run_finished(&summary);
        Ok(summary)
    }

    /// Runs until the tree is quiet or `max_runs` is reached.
    pub async fn run_until_settled(
        &self,
        cancel: &CancellationToken,
        max_runs: usize,
    ) -> Result<RunSummary, EngineError> {
        let mut summary = self.run(cancel).await?;
        for _ in 1..max_runs {
            if !summary.needs_followup || cancel.is_cancelled() {
                break;
            }
            summary = self.run(cancel).await?;
        }
        Ok(summary)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
