use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use super::conflict::{ConflictResolver, Resolution};
use super::discovery::{self, Change, ChangeKind, ConflictKind};
use super::item::ItemRecord;
use super::job::{FailureKind, Job, JobId, JobKind, JobState, SkipReason};
use super::journal::{BlacklistEntry, JournalEntry, PinStates};
use super::paths;
use super::vfs::VfsMode;

/// Settings shared by planning and by conflicts decided mid-run.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub local_root: PathBuf,
    pub vfs: VfsMode,
    pub pins: PinStates,
    pub resolver: ConflictResolver,
    /// Conflict copy stamp for this run.
    pub stamp: String,
    pub case_insensitive: bool,
    pub upload_conflict_copies: bool,
}

/// One unit of work before it becomes a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub path: String,
    pub kind: JobKind,
    pub conflict: Option<ConflictKind>,
}

#[derive(Debug, Default)]
pub struct Steps {
    pub steps: Vec<Step>,
    /// The work reveals items only a later run can see.
    pub followup: bool,
}

impl Steps {
    fn push(&mut self, path: &str, kind: JobKind) {
        self.steps.push(Step {
            path: path.to_string(),
            kind,
            conflict: None,
        });
    }
}

/// A conflict nothing can settle; reported as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub path: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub jobs: Vec<Job>,
    pub unresolved: Vec<Unresolved>,
    pub needs_followup: bool,
}

pub struct Planner<'a> {
    options: &'a PlanOptions,
    blacklist: &'a BTreeMap<String, BlacklistEntry>,
    now: i64,
}

impl<'a> Planner<'a> {
    pub fn new(
        options: &'a PlanOptions,
        blacklist: &'a BTreeMap<String, BlacklistEntry>,
        now: i64,
    ) -> Self {
        Self {
            options,
            blacklist,
            now,
        }
    }

    pub fn plan(&self, changes: &[Change]) -> Plan {
        let mut occupied = Occupied::new(self.options.case_insensitive);
        for change in changes {
            if change.local.is_some() || change.remote.is_some() {
                occupied.insert(&change.path);
            }
        }

        let mut plan = Plan::default();
        for change in changes {
            let steps = if let Some(kind) = change.conflict_kind() {
                let taken = |path: &str| occupied.contains(path) || self.options.local_exists(path);
                match self.options.resolver.resolve(change, &taken) {
                    Ok(resolution) => {
                        tracing::debug!(path = %change.path, kind = kind.as_str(), ?resolution, "conflict resolved");
                        self.options.steps_for_resolution(change, &resolution, &taken)
                    }
                    Err(err) => {
                        tracing::warn!(path = %change.path, error = %err, "conflict left unresolved");
                        plan.unresolved.push(Unresolved {
                            path: change.path.clone(),
                            kind: match kind {
                                ConflictKind::Inaccessible => FailureKind::LocalIo,
                                ConflictKind::PermissionLoss => FailureKind::PermissionDenied,
                                _ => FailureKind::Conflict,
                            },
                            reason: err.to_string(),
                        });
                        continue;
                    }
                }
            } else {
                self.options.steps_for_change(change)
            };
            plan.needs_followup |= steps.followup;
            for step in steps.steps {
                occupied.insert(&step.path);
                let mut job = Job::new(plan.jobs.len(), step.path, step.kind);
                job.conflict = step.conflict;
                plan.jobs.push(job);
            }
        }

        self.skip_blacklisted(&mut plan.jobs);
        link_dependencies(&mut plan.jobs);
        plan
    }

    fn skip_blacklisted(&self, jobs: &mut [Job]) {
        for job in jobs {
            if matches!(job.kind, JobKind::UpdateMetadata { .. } | JobKind::Forget) {
                continue;
            }
            if let Some(entry) = self.blacklist.get(&job.path)
                && !entry.is_eligible(self.now)
            {
                tracing::debug!(path = %job.path, kind = %entry.kind, "blacklisted, skipping");
                job.state = JobState::Skipped(SkipReason::Blacklisted);
            }
        }
    }
}

impl PlanOptions {
    pub fn local_exists(&self, rel: &str) -> bool {
        paths::local_path_for(&self.local_root, rel)
            .map(|path| path.symlink_metadata().is_ok())
            .unwrap_or(false)
    }

    fn wants_placeholder(&self, path: &str) -> bool {
        self.vfs == VfsMode::Suffix && !self.pins.is_pinned(path)
    }

    pub fn steps_for_change(&self, change: &Change) -> Steps {
        let path = change.path.as_str();
        let mut out = Steps::default();
        let local = change.local.as_ref();
        let remote = change.remote.as_ref();
        match (&change.kind, local, remote) {
            (ChangeKind::Unchanged, Some(l), Some(r)) => {
                if l.placeholder && !self.wants_placeholder(path) {
                    out.push(
                        path,
                        JobKind::Download {
                            remote: r.clone(),
                            local: None,
                        },
                    );
                }
            }
            (ChangeKind::UpdateMetadata, _, Some(r)) => out.push(
                path,
                JobKind::UpdateMetadata {
                    entry: JournalEntry::synced(path, local, r),
                },
            ),
            (ChangeKind::Forget, _, _) => out.push(path, JobKind::Forget),
            (ChangeKind::LocalNew, Some(l), _) => out.push(path, upload_kind(l, None)),
            (ChangeKind::LocalModified, Some(l), Some(r)) if l.item_type != r.item_type => {
                out.push(path, JobKind::RemoteDelete { remote: r.clone() });
                out.push(path, upload_kind(l, None));
                out.followup |= l.is_dir();
            }
            (ChangeKind::LocalModified, Some(l), r) => out.push(path, upload_kind(l, r.cloned())),
            (ChangeKind::LocalDeleted, _, Some(r)) => {
                out.push(path, JobKind::RemoteDelete { remote: r.clone() })
            }
            (ChangeKind::LocalRenamed { from, .. }, Some(l), _) => {
                out.push(
                    path,
                    JobKind::RemoteMove {
                        from: from.clone(),
                        local: Some(l.clone()),
                    },
                );
                if let Some(base) = &change.base
                    && discovery::local_changed(l, base)
                {
                    out.push(path, upload_kind(l, remote.cloned()));
                }
            }
            (ChangeKind::RemoteNew, _, Some(r)) => {
                out.push(path, self.create_local(path, r, local));
            }
            (ChangeKind::RemoteModified, Some(l), Some(r)) if l.item_type != r.item_type => {
                out.push(path, JobKind::LocalDelete { local: l.clone() });
                out.push(path, self.create_local(path, r, None));
                out.followup |= r.is_dir();
            }
            (ChangeKind::RemoteModified, _, Some(r)) => {
                out.push(path, self.create_local(path, r, local));
            }
            (ChangeKind::RemoteDeleted, Some(l), _) => {
                out.push(path, JobKind::LocalDelete { local: l.clone() })
            }
            (ChangeKind::RemoteRenamed { from, .. }, _, Some(r)) => {
                out.push(
                    path,
                    JobKind::LocalMove {
                        from: from.clone(),
                        remote: Some(r.clone()),
                    },
                );
                if let Some(base) = &change.base
                    && discovery::remote_changed(r, base)
                {
                    out.push(path, self.create_local(path, r, local));
                }
            }
            (kind, _, _) => {
                if !matches!(kind, ChangeKind::Unchanged | ChangeKind::Conflict { .. }) {
                    tracing::warn!(path, ?kind, "change without the records it needs, skipping");
                }
            }
        }
        out
    }

    pub fn steps_for_resolution(
        &self,
        change: &Change,
        resolution: &Resolution,
        taken: &dyn Fn(&str) -> bool,
    ) -> Steps {
        let path = change.path.as_str();
        let conflict = change.conflict_kind().unwrap_or(ConflictKind::EditEdit);
        let mut out = Steps::default();
        match resolution {
            Resolution::KeepLocal => match (&change.local, &change.remote) {
                (Some(l), Some(r)) if l.item_type != r.item_type => {
                    out.push(path, JobKind::RemoteDelete { remote: r.clone() });
                    out.push(path, upload_kind(l, None));
                    out.followup |= l.is_dir();
                }
                (Some(l), r) => out.push(path, upload_kind(l, r.clone())),
                (None, _) => return self.steps_for_resolution(change, &Resolution::KeepRemote, taken),
            },
            Resolution::KeepRemote => match (&change.local, &change.remote) {
                (Some(l), Some(r)) if l.item_type != r.item_type => {
                    out.push(path, JobKind::LocalDelete { local: l.clone() });
                    out.push(path, self.create_local(path, r, None));
                    out.followup |= r.is_dir();
                }
                (l, Some(r)) => {
                    out.push(path, self.create_local(path, r, l.as_ref()));
                    out.followup |= r.is_dir();
                }
                (_, None) => {}
            },
            Resolution::KeepBoth => {
                let Some(local) = &change.local else {
                    return self.steps_for_resolution(change, &Resolution::KeepRemote, taken);
                };
                let copy = self.resolver.copy_path(path, &self.stamp, taken);
                out.push(
                    &copy,
                    JobKind::LocalMove {
                        from: path.to_string(),
                        remote: None,
                    },
                );
                if let Some(r) = &change.remote {
                    out.push(path, self.create_local(path, r, None));
                    out.followup |= r.is_dir();
                }
                if self.upload_conflict_copies {
                    let moved = ItemRecord {
                        path: copy.clone(),
                        ..local.clone()
                    };
                    out.push(&copy, upload_kind(&moved, None));
                    out.followup |= local.is_dir();
                }
            }
            Resolution::RequiresUserChoice { suggestion } => {
                out.push(
                    path,
                    JobKind::AwaitChoice {
                        change: change.clone(),
                        suggestion: suggestion.clone(),
                    },
                );
                return out;
            }
            Resolution::RenameAndRetry { new_path } => {
                let kind = if change.local.is_none() && change.remote.is_some() {
                    JobKind::RemoteMove {
                        from: path.to_string(),
                        local: None,
                    }
                } else {
                    JobKind::LocalMove {
                        from: path.to_string(),
                        remote: None,
                    }
                };
                out.push(new_path, kind);
                out.followup = true;
            }
        }
        if let Some(first) = out.steps.first_mut() {
            first.conflict = Some(conflict);
        }
        out
    }

    /// Brings a remote item to the local side. Unpinned files become
    /// placeholders unless real content is already there.
    fn create_local(&self, path: &str, remote: &ItemRecord, local: Option<&ItemRecord>) -> JobKind {
        if remote.is_dir() {
            return JobKind::LocalMkdir {
                remote: remote.clone(),
            };
        }
        let real = local.filter(|l| !l.placeholder).cloned();
        if real.is_none() && self.wants_placeholder(path) {
            JobKind::WritePlaceholder {
                remote: remote.clone(),
                local: None,
            }
        } else {
            JobKind::Download {
                remote: remote.clone(),
                local: real,
            }
        }
    }
}

fn upload_kind(local: &ItemRecord, remote: Option<ItemRecord>) -> JobKind {
    if local.is_dir() {
        JobKind::RemoteMkdir {
            local: local.clone(),
        }
    } else {
        JobKind::Upload {
            local: local.clone(),
            remote,
        }
    }
}

struct Occupied {
    case_insensitive: bool,
    keys: HashSet<String>,
}

impl Occupied {
    fn new(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            keys: HashSet::new(),
        }
    }

    fn key(&self, path: &str) -> String {
        if self.case_insensitive {
            paths::case_key(path)
        } else {
            path.to_string()
        }
    }

    fn insert(&mut self, path: &str) {
        let key = self.key(path);
        self.keys.insert(key);
    }

    fn contains(&self, path: &str) -> bool {
        self.keys.contains(&self.key(path))
    }
}

/// Orders jobs: children after the structural job of their nearest
/// ancestor, jobs sharing a path in plan order, work below a move source
/// after the move, and deletions after everything beneath them.
pub fn link_dependencies(jobs: &mut [Job]) {
    let mut structural: HashMap<String, JobId> = HashMap::new();
    let mut last_touch: HashMap<String, JobId> = HashMap::new();
    let mut moves: HashMap<String, Vec<JobId>> = HashMap::new();

    for id in 0..jobs.len() {
        let path = jobs[id].path.clone();
        let source = jobs[id].kind.move_source().map(str::to_string);
        let mut deps = BTreeSet::new();

        let mut current = paths::parent_path(&path);
        while let Some(parent) = current.filter(|p| !p.is_empty()) {
            if let Some(&owner) = structural.get(parent) {
                deps.insert(owner);
                break;
            }
            current = paths::parent_path(parent);
        }
        for touched in std::iter::once(&path).chain(source.as_ref()) {
            if let Some(&owner) = last_touch.get(touched) {
                deps.insert(owner);
            }
            for ancestor in std::iter::successors(paths::parent_path(touched), |p| paths::parent_path(*p)) {
                if let Some(owners) = moves.get(ancestor) {
                    deps.extend(owners.iter().copied());
                }
            }
        }
        deps.remove(&id);
        jobs[id].deps = deps.into_iter().collect();

        last_touch.insert(path.clone(), id);
        if let Some(source) = &source {
            last_touch.insert(source.clone(), id);
        }
        if jobs[id].kind.is_structural() {
            structural.insert(path, id);
        }
        if let Some(source) = source {
            moves.entry(source).or_default().push(id);
        }
    }

    // Every path a job touches, sorted so a directory's contents are one range.
    let mut touched: BTreeMap<String, Vec<JobId>> = BTreeMap::new();
    for (id, job) in jobs.iter().enumerate() {
        touched.entry(job.path.clone()).or_default().push(id);
        if let Some(from) = job.kind.move_source() {
            touched.entry(from.to_string()).or_default().push(id);
        }
    }
    for id in 0..jobs.len() {
        if !jobs[id].kind.is_deletion() {
            continue;
        }
        let prefix = match jobs[id].path.as_str() {
            "" => String::new(),
            dir => format!("{dir}/"),
        };
        let beneath: Vec<JobId> = touched
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path.is_empty())
            .flat_map(|(_, ids)| ids.iter().copied())
            .filter(|&other| other != id)
            .collect();
        for other in beneath {
            if !depends_on(jobs, other, id) {
                jobs[id].deps.push(other);
            }
        }
        jobs[id].deps.sort_unstable();
        jobs[id].deps.dedup();
    }
}

fn depends_on(jobs: &[Job], from: JobId, target: JobId) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if seen.insert(id) {
            stack.extend(jobs[id].deps.iter().copied());
        }
    }
    false
}

#[cfg(test)]
#[path = "planner_tests.rs"]
mod tests;
