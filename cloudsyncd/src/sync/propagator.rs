use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::conflict::Resolution;
use super::discovery::{Change, ConflictKind, local_changed};
use super::exclude::is_partial_name;
use super::item::ItemRecord;
use super::job::{FailureKind, Job, JobId, JobKind, JobState, SkipReason};
use super::journal::{Journal, JournalEntry, JournalUpdate};
use super::local_walker::{record_from_metadata, stat_path, unchanged_since};
use super::observer::SyncObserver;
use super::paths;
use super::planner::PlanOptions;
use super::remote::{RemoteStore, is_invalid_move_target};
use super::transfer::{FreeSpace, TransferClient, TransferError};
use super::vfs::{self, VfsMode};

#[derive(Debug, Clone)]
pub struct PropagatorConfig {
    /// Jobs executing at once.
    pub parallelism: usize,
    pub move_to_trash: bool,
    /// Local bytes that must stay free after all downloads of a run.
    pub free_space_margin: u64,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            parallelism: 6,
            move_to_trash: false,
            free_space_margin: 250 * 1024 * 1024,
        }
    }
}

/// A failure to record in the blacklist when the run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub path: String,
    pub kind: FailureKind,
    pub reason: String,
    /// Server hint, in seconds.
    pub retry_after: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub jobs: Vec<Job>,
    pub failures: Vec<JobFailure>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub needs_followup: bool,
}

#[derive(Debug, Default)]
struct Completed {
    bytes_up: u64,
    bytes_down: u64,
    followup: bool,
    updates: Vec<JournalUpdate>,
}

impl Completed {
    fn with(updates: Vec<JournalUpdate>) -> Self {
        Self {
            updates,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
enum JobOutcome {
    Done {
        bytes_up: u64,
        bytes_down: u64,
        followup: bool,
    },
    Failed(JobFailure),
    Skipped {
        reason: SkipReason,
        failure: Option<JobFailure>,
    },
}

impl JobOutcome {
    fn skipped(reason: SkipReason) -> Self {
        JobOutcome::Skipped {
            reason,
            failure: None,
        }
    }

    fn from_error(path: &str, err: TransferError) -> Self {
        match err {
            TransferError::ChangedDuringSync(_) => Self::skipped(SkipReason::ChangedDuringSync),
            TransferError::Cancelled => Self::skipped(SkipReason::Cancelled),
            err => JobOutcome::Failed(JobFailure {
                path: path.to_string(),
                kind: err.failure_kind(),
                reason: err.to_string(),
                retry_after: err.retry_after_secs(),
            }),
        }
    }
}

/// Bytes still available for this run's transfers. `None` means unknown or
/// unlimited.
#[derive(Debug)]
struct SpaceBudget {
    local: Option<u64>,
    remote: Option<u64>,
    margin: u64,
}

impl SpaceBudget {
    fn reserve_local(&mut self, bytes: u64) -> bool {
        match self.local {
            _ if bytes == 0 => true,
            None => true,
            Some(available) if available >= bytes.saturating_add(self.margin) => {
                self.local = Some(available - bytes);
                true
            }
            Some(_) => false,
        }
    }

    fn reserve_remote(&mut self, bytes: u64) -> bool {
        match self.remote {
            _ if bytes == 0 => true,
            None => true,
            Some(available) if available >= bytes => {
                self.remote = Some(available - bytes);
                true
            }
            Some(_) => false,
        }
    }
}

/// Dependency bookkeeping for one run. Each job counts its unfinished
/// dependencies; a finished job only touches its own dependents.
#[derive(Debug)]
struct Schedule {
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<JobId>>,
    ready: VecDeque<JobId>,
}

impl Schedule {
    fn new(jobs: &[Job]) -> Self {
        let mut dependents = vec![Vec::new(); jobs.len()];
        let mut waiting_on = vec![0; jobs.len()];
        for (id, job) in jobs.iter().enumerate() {
            for &dep in &job.deps {
                if dep < jobs.len() && dep != id {
                    dependents[dep].push(id);
                    waiting_on[id] += 1;
                }
            }
        }
        let ready = (0..jobs.len()).filter(|&id| waiting_on[id] == 0).collect();
        Self {
            waiting_on,
            dependents,
            ready,
        }
    }

    /// Records that `id` settled. A successful job queues the dependents it
    /// was the last blocker of; otherwise every dependent is returned so it
    /// can be skipped.
    fn settled(&mut self, id: JobId, done: bool) -> Vec<JobId> {
        let dependents = std::mem::take(&mut self.dependents[id]);
        if !done {
            return dependents;
        }
        for dependent in dependents {
            self.waiting_on[dependent] -= 1;
            if self.waiting_on[dependent] == 0 {
                self.ready.push_back(dependent);
            }
        }
        Vec::new()
    }
}

/// Executes a plan's jobs: in dependency order, up to `parallelism` at a
/// time, committing each job's journal updates before its dependents start.
#[derive(Clone)]
pub struct Propagator {
    remote: Arc<dyn RemoteStore>,
    journal: Arc<Journal>,
    transfers: TransferClient,
    observer: Arc<dyn SyncObserver>,
    space: Arc<dyn FreeSpace>,
    plan: Arc<PlanOptions>,
    config: PropagatorConfig,
}

impl Propagator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        journal: Arc<Journal>,
        transfers: TransferClient,
        observer: Arc<dyn SyncObserver>,
        space: Arc<dyn FreeSpace>,
        plan: Arc<PlanOptions>,
        config: PropagatorConfig,
    ) -> Self {
        Self {
            remote,
            journal,
            transfers,
            observer,
            space,
            plan,
            config,
        }
    }

    fn local_root(&self) -> &Path {
        &self.plan.local_root
    }

    pub async fn run(&self, mut jobs: Vec<Job>, cancel: &CancellationToken) -> Outcome {
        let mut outcome = Outcome::default();
        let mut budget = SpaceBudget {
            local: self.space.available(self.local_root()).ok(),
            remote: match self.remote.quota().await {
                Ok(quota) => quota,
                Err(err) => {
                    tracing::warn!(error = %err, "could not read remote quota");
                    None
                }
            },
            margin: self.config.free_space_margin,
        };
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut tasks: JoinSet<(JobId, JobOutcome)> = JoinSet::new();
        let mut schedule = Schedule::new(&jobs);

        loop {
            while let Some(id) = schedule.ready.pop_front() {
                if jobs[id].state != JobState::Pending {
                    continue;
                }
                if cancel.is_cancelled() {
                    let skip = JobOutcome::skipped(SkipReason::Cancelled);
                    self.settle_job(&mut jobs, &mut schedule, id, skip, &mut outcome);
                    continue;
                }
                if let Some(skip) = self.reserve_space(&jobs[id], &mut budget) {
                    self.settle_job(&mut jobs, &mut schedule, id, skip, &mut outcome);
                    continue;
                }
                self.start(id, &mut jobs[id], &mut tasks, &semaphore, cancel);
            }
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((id, result)) => {
                    self.settle_job(&mut jobs, &mut schedule, id, result, &mut outcome);
                }
                Err(err) => tracing::error!(error = %err, "propagation task failed to complete"),
            }
        }

        for job in &mut jobs {
            match job.state {
                JobState::Running => {
                    job.state = JobState::Failed(FailureKind::LocalIo);
                    outcome.failures.push(JobFailure {
                        path: job.path.clone(),
                        kind: FailureKind::LocalIo,
                        reason: "job aborted".into(),
                        retry_after: None,
                    });
                }
                JobState::Pending => job.state = JobState::Skipped(SkipReason::DependencyFailed),
                _ => {}
            }
        }
        outcome.jobs = jobs;
        outcome
    }

    fn start(
        &self,
        id: JobId,
        job: &mut Job,
        tasks: &mut JoinSet<(JobId, JobOutcome)>,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        job.state = JobState::Running;
        self.observer.job_started(job);
        let job = job.clone();
        let this = self.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (id, JobOutcome::skipped(SkipReason::Cancelled));
            };
            if cancel.is_cancelled() {
                return (id, JobOutcome::skipped(SkipReason::Cancelled));
            }
            (id, this.run_job(&job, &cancel).await)
        });
    }

    /// Finishes `id` and skips every pending job that transitively depended
    /// on it, unless it succeeded.
    fn settle_job(
        &self,
        jobs: &mut [Job],
        schedule: &mut Schedule,
        id: JobId,
        result: JobOutcome,
        outcome: &mut Outcome,
    ) {
        self.finish(&mut jobs[id], result, outcome);
        let reason = match jobs[id].state {
            JobState::Skipped(SkipReason::Cancelled) => SkipReason::Cancelled,
            _ => SkipReason::DependencyFailed,
        };
        let mut blocked = schedule.settled(id, jobs[id].state == JobState::Done);
        while let Some(dependent) = blocked.pop() {
            if jobs[dependent].state != JobState::Pending {
                continue;
            }
            self.finish(&mut jobs[dependent], JobOutcome::skipped(reason), outcome);
            blocked.extend(schedule.settled(dependent, false));
        }
    }

    fn reserve_space(&self, job: &Job, budget: &mut SpaceBudget) -> Option<JobOutcome> {
        let reason = match &job.kind {
            JobKind::Download { remote, .. } if !budget.reserve_local(remote.size) => {
                SkipReason::InsufficientLocalSpace
            }
            JobKind::Upload { local, remote } => {
                let growth = local.size.saturating_sub(remote.as_ref().map_or(0, |r| r.size));
                if budget.reserve_remote(growth) {
                    return None;
                }
                SkipReason::QuotaExceeded
            }
            _ => return None,
        };
        tracing::warn!(path = %job.path, %reason, "not enough space, skipping");
        let failure = reason.blacklist_kind().map(|kind| JobFailure {
            path: job.path.clone(),
            kind,
            reason: match reason {
                SkipReason::InsufficientLocalSpace => "not enough free local disk space".into(),
                _ => "remote storage quota exceeded".into(),
            },
            retry_after: None,
        });
        Some(JobOutcome::Skipped { reason, failure })
    }

    fn finish(&self, job: &mut Job, result: JobOutcome, outcome: &mut Outcome) {
        match result {
            JobOutcome::Done {
                bytes_up,
                bytes_down,
                followup,
            } => {
                job.state = JobState::Done;
                outcome.bytes_up += bytes_up;
                outcome.bytes_down += bytes_down;
                outcome.needs_followup |= followup;
            }
            JobOutcome::Failed(failure) => {
                job.state = JobState::Failed(failure.kind);
                outcome.failures.push(failure);
            }
            JobOutcome::Skipped { reason, failure } => {
                job.state = JobState::Skipped(reason);
                outcome.needs_followup |= reason == SkipReason::ChangedDuringSync;
                outcome.failures.extend(failure);
            }
        }
        self.observer.job_finished(job);
    }

    async fn run_job(&self, job: &Job, cancel: &CancellationToken) -> JobOutcome {
        if let JobKind::AwaitChoice { change, suggestion } = &job.kind {
            return self.await_choice(job, change, suggestion.as_deref(), cancel).await;
        }
        let result = self.execute(&job.path, &job.kind, cancel).await;
        self.settle(&job.path, &job.kind, job.conflict, result).await
    }

    /// Commits a finished step's journal updates, plus its conflict record.
    async fn settle(
        &self,
        path: &str,
        kind: &JobKind,
        conflict: Option<ConflictKind>,
        result: Result<Completed, TransferError>,
    ) -> JobOutcome {
        let mut done = match result {
            Ok(done) => done,
            Err(err) => return JobOutcome::from_error(path, err),
        };
        if let Some(conflict) = conflict {
            done.updates.push(conflict_record(path, kind, conflict));
        }
        if let Err(err) = self.journal.commit(&done.updates).await {
            return JobOutcome::from_error(path, err.into());
        }
        JobOutcome::Done {
            bytes_up: done.bytes_up,
            bytes_down: done.bytes_down,
            followup: done.followup,
        }
    }

    async fn await_choice(
        &self,
        job: &Job,
        change: &Change,
        suggestion: Option<&str>,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let kind = change.conflict_kind().unwrap_or(ConflictKind::EditEdit);
        let resolution = match self.observer.resolve_conflict(change, suggestion).await {
            Some(Resolution::RequiresUserChoice { .. }) | None => {
                let pending = JournalUpdate::RecordConflict {
                    path: job.path.clone(),
                    kind: kind.as_str().to_string(),
                    renamed_local: None,
                };
                if let Err(err) = self.journal.commit(&[pending]).await {
                    tracing::warn!(path = %job.path, error = %err, "could not record conflict");
                }
                return JobOutcome::skipped(SkipReason::AwaitingUserChoice);
            }
            Some(resolution) => resolution,
        };
        tracing::info!(path = %job.path, ?resolution, "conflict resolved by user");

        let taken = |path: &str| self.plan.local_exists(path);
        let steps = self.plan.steps_for_resolution(change, &resolution, &taken);
        let (mut bytes_up, mut bytes_down, mut followup) = (0, 0, steps.followup);
        for step in &steps.steps {
            let result = self.execute(&step.path, &step.kind, cancel).await;
            match self.settle(&step.path, &step.kind, step.conflict, result).await {
                JobOutcome::Done {
                    bytes_up: up,
                    bytes_down: down,
                    followup: more,
                } => {
                    bytes_up += up;
                    bytes_down += down;
                    followup |= more;
                }
                other => return other,
            }
        }
        JobOutcome::Done {
            bytes_up,
            bytes_down,
            followup,
        }
    }

    /// Performs one job's side effects and returns the journal updates that
    /// describe the new synced state.
    async fn execute(
        &self,
        path: &str,
        kind: &JobKind,
        cancel: &CancellationToken,
    ) -> Result<Completed, TransferError> {
        let target = paths::local_path_for(self.local_root(), path)?;
        match kind {
            JobKind::Download { remote, local } => {
                let total = remote.size;
                let progress = |done: u64| self.observer.job_progress(path, done, total);
                let record = self
                    .transfers
                    .download(path, remote, local.as_ref(), cancel, &progress)
                    .await?;
                if self.plan.vfs == VfsMode::Suffix {
                    remove_path(&vfs::placeholder_path(&target)).await?;
                }
                Ok(Completed {
                    bytes_down: remote.size,
                    ..Completed::with(vec![JournalUpdate::Upsert(JournalEntry::synced(
                        path,
                        Some(&record),
                        remote,
                    ))])
                })
            }
            JobKind::WritePlaceholder { remote, .. } => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let record = remote.clone();
                tokio::task::spawn_blocking(move || vfs::write_placeholder(&target, &record))
                    .await
                    .map_err(io::Error::other)??;
                Ok(Completed::with(vec![JournalUpdate::Upsert(
                    JournalEntry::synced(path, None, remote),
                )]))
            }
            JobKind::Upload { local, .. } => {
                let total = local.size;
                let progress = |done: u64| self.observer.job_progress(path, done, total);
                let record = self.transfers.upload(path, local, cancel, &progress).await?;
                Ok(Completed {
                    bytes_up: local.size,
                    ..Completed::with(vec![
                        JournalUpdate::Upsert(JournalEntry::synced(path, Some(local), &record)),
                        JournalUpdate::ClearUploadSession {
                            path: path.to_string(),
                        },
                    ])
                })
            }
            JobKind::LocalMkdir { remote } => {
                tokio::fs::create_dir_all(&target).await?;
                let local = stat_path(&target, path)?;
                Ok(Completed::with(vec![JournalUpdate::Upsert(
                    JournalEntry::synced(path, local.as_ref(), remote),
                )]))
            }
            JobKind::RemoteMkdir { local } => {
                let record = match self.remote.mkdir(path).await {
                    Ok(record) => record,
                    Err(err) if err.status() == Some(StatusCode::CONFLICT) => {
                        match self.remote.stat(path).await? {
                            Some(existing) if existing.is_dir() => existing,
                            _ => return Err(err.into()),
                        }
                    }
                    Err(err) => return Err(err.into()),
                };
                Ok(Completed::with(vec![JournalUpdate::Upsert(
                    JournalEntry::synced(path, Some(local), &record),
                )]))
            }
            JobKind::LocalDelete { local } => {
                if local.placeholder {
                    remove_path(&vfs::placeholder_path(&target)).await?;
                } else if local.is_dir() {
                    self.remove_synced_dir(path, &target).await?;
                } else {
                    let current = stat_path(&target, path)?;
                    if !unchanged_since(Some(local), current.as_ref()) {
                        return Err(TransferError::ChangedDuringSync(path.to_string()));
                    }
                    if current.is_some() {
                        self.remove_local(&target).await?;
                    }
                }
                Ok(Completed::with(vec![JournalUpdate::DeleteTree {
                    path: path.to_string(),
                }]))
            }
            JobKind::RemoteDelete { .. } => {
                match self.remote.delete(path).await {
                    Err(err) if !err.is_not_found() => return Err(err.into()),
                    _ => {}
                }
                Ok(Completed::with(vec![JournalUpdate::DeleteTree {
                    path: path.to_string(),
                }]))
            }
            JobKind::LocalMove { from, remote } => {
                let source = paths::local_path_for(self.local_root(), from)?;
                self.move_local(from, path, &source, &target).await?;
                let mut updates = Vec::new();
                if let Some(remote) = remote {
                    let local = stat_path(&target, path)?;
                    updates.push(JournalUpdate::MoveTree {
                        from: from.clone(),
                        to: path.to_string(),
                    });
                    updates.push(JournalUpdate::Upsert(JournalEntry::synced(
                        path,
                        local.as_ref(),
                        remote,
                    )));
                }
                Ok(Completed::with(updates))
            }
            JobKind::RemoteMove { from, local } => {
                let record = match self.remote.move_item(from, path).await {
                    Ok(record) => record,
                    Err(err) => {
                        if local.is_some() && is_invalid_move_target(&err) {
                            self.restore_local_move(from, path).await;
                        }
                        return Err(err.into());
                    }
                };
                let Some(local) = local else {
                    return Ok(Completed {
                        followup: true,
                        ..Completed::default()
                    });
                };
                Ok(Completed::with(vec![
                    JournalUpdate::MoveTree {
                        from: from.clone(),
                        to: path.to_string(),
                    },
                    JournalUpdate::Upsert(JournalEntry::synced(path, Some(local), &record)),
                ]))
            }
            JobKind::UpdateMetadata { entry } => {
                Ok(Completed::with(vec![JournalUpdate::Upsert(entry.clone())]))
            }
            JobKind::Forget => Ok(Completed::with(vec![JournalUpdate::DeleteTree {
                path: path.to_string(),
            }])),
            JobKind::AwaitChoice { .. } => {
                tracing::debug!(path, "nested conflict choice left for the next run");
                Ok(Completed {
                    followup: true,
                    ..Completed::default()
                })
            }
        }
    }

    async fn move_local(
        &self,
        from: &str,
        to: &str,
        source: &Path,
        target: &Path,
    ) -> Result<(), TransferError> {
        let case_only = paths::case_key(from) == paths::case_key(to);
        if !case_only && tokio::fs::symlink_metadata(target).await.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{to} already exists locally"),
            )
            .into());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(source, target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound && self.plan.vfs == VfsMode::Suffix => {
                let placeholder = vfs::placeholder_path(source);
                if tokio::fs::symlink_metadata(&placeholder).await.is_err() {
                    return Err(err.into());
                }
                tokio::fs::rename(&placeholder, vfs::placeholder_path(target)).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The server refused a rename we mirrored from the local side: put the
    /// local item back so both sides agree again.
    async fn restore_local_move(&self, from: &str, to: &str) {
        let (Ok(source), Ok(target)) = (
            paths::local_path_for(self.local_root(), from),
            paths::local_path_for(self.local_root(), to),
        ) else {
            return;
        };
        match tokio::fs::rename(&target, &source).await {
            Ok(()) => tracing::warn!(path = from, "remote refused the move, restored local item"),
            Err(err) => tracing::error!(path = to, error = %err, "could not restore refused move"),
        }
    }

    /// Removes a directory deleted on the remote, as long as everything in
    /// it is still in its last synced state. An unknown or edited item stops
    /// the removal and is left for the next run.
    async fn remove_synced_dir(&self, rel: &str, target: &Path) -> Result<(), TransferError> {
        let synced = self.journal.load_subtree(rel).await?;
        let root = self.local_root().to_path_buf();
        let dir = target.to_path_buf();
        let vfs = self.plan.vfs;
        let doomed = tokio::task::spawn_blocking(move || synced_tree(&root, &dir, &synced, vfs))
            .await
            .map_err(io::Error::other)??;
        if doomed.is_empty() {
            return Ok(());
        }
        if self.config.move_to_trash {
            return Ok(self.remove_local(target).await?);
        }
        tokio::task::spawn_blocking(move || remove_synced_items(doomed))
            .await
            .map_err(io::Error::other)?
    }

    async fn remove_local(&self, path: &Path) -> io::Result<()> {
        if self.config.move_to_trash {
            let path = path.to_path_buf();
            return tokio::task::spawn_blocking(move || trash::delete(&path).map_err(io::Error::other))
                .await
                .map_err(io::Error::other)?;
        }
        remove_path(path).await
    }
}

fn conflict_record(path: &str, kind: &JobKind, conflict: ConflictKind) -> JournalUpdate {
    let (original, renamed_local) = match kind {
        JobKind::LocalMove { from, .. } => (from.clone(), Some(path.to_string())),
        JobKind::RemoteMove { from, .. } => (from.clone(), None),
        _ => (path.to_string(), None),
    };
    JournalUpdate::RecordConflict {
        path: original,
        kind: conflict.as_str().to_string(),
        renamed_local,
    }
}

/// Everything below `dir`, children first, provided the journal knows each
/// item in its current state.
fn synced_tree(
    root: &Path,
    dir: &Path,
    synced: &BTreeMap<String, JournalEntry>,
    vfs: VfsMode,
) -> Result<Vec<(PathBuf, ItemRecord)>, TransferError> {
    let mut doomed = Vec::new();
    for entry in WalkDir::new(dir).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.io_error().is_some_and(|e| e.kind() == io::ErrorKind::NotFound) => {
                continue;
            }
            Err(err) => return Err(io::Error::from(err).into()),
        };
        let rel = paths::rel_path_from_local(root, entry.path())?;
        let metadata = entry.metadata().map_err(io::Error::from)?;
        let record = record_from_metadata(&rel, &metadata);
        if !is_synced(&record, synced, vfs) {
            tracing::info!(path = %rel, "unsynced item inside a directory deleted remotely");
            return Err(TransferError::ChangedDuringSync(rel));
        }
        doomed.push((entry.into_path(), record));
    }
    Ok(doomed)
}

fn is_synced(record: &ItemRecord, synced: &BTreeMap<String, JournalEntry>, vfs: VfsMode) -> bool {
    let name = paths::file_name(&record.path);
    if !record.is_dir() && is_partial_name(name) {
        return true;
    }
    if vfs == VfsMode::Suffix
        && !record.is_dir()
        && let Some(stem) = vfs::strip_placeholder_suffix(name)
    {
        let parent = paths::parent_path(&record.path).unwrap_or("");
        return synced.contains_key(&paths::join(parent, stem));
    }
    synced
        .get(&record.path)
        .is_some_and(|entry| !local_changed(record, entry))
}

/// Removes items from `synced_tree` in order. Directories are removed with
/// `remove_dir`, so anything created since the scan keeps its directory.
fn remove_synced_items(doomed: Vec<(PathBuf, ItemRecord)>) -> Result<(), TransferError> {
    for (local, record) in doomed {
        let result = if record.is_dir() {
            std::fs::remove_dir(&local)
        } else {
            if let Some(current) = stat_path(&local, &record.path)?
                && !unchanged_since(Some(&record), Some(&current))
            {
                return Err(TransferError::ChangedDuringSync(record.path));
            }
            std::fs::remove_file(&local)
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => {
                return Err(TransferError::ChangedDuringSync(record.path));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Removes a file or a whole directory tree; a missing path is fine.
async fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "propagator_tests.rs"]
mod tests;
