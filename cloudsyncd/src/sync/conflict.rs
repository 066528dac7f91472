use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

use super::discovery::{Change, ConflictKind};
use super::names::{self, NameRules};
use super::paths;

/// What to do with an edit/edit conflict when nobody is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Leave the conflict to the observer.
    #[default]
    Ask,
    /// Keep the remote version at the path and step the local one aside.
    KeepBoth,
    KeepLocal,
    KeepRemote,
}

impl ConflictPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keep-both" | "keep_both" | "both" => Some(ConflictPolicy::KeepBoth),
            "ask" => Some(ConflictPolicy::Ask),
            "keep-local" | "keep_local" | "local" => Some(ConflictPolicy::KeepLocal),
            "keep-remote" | "keep_remote" | "remote" => Some(ConflictPolicy::KeepRemote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Local content wins and overwrites the remote.
    KeepLocal,
    /// Remote content wins and overwrites the local item.
    KeepRemote,
    /// Local item moves to a conflict copy; the remote lands at the path.
    KeepBoth,
    RequiresUserChoice { suggestion: Option<String> },
    /// Move the conflicting item to `new_path` on its own side, then sync.
    RenameAndRetry { new_path: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("cannot restore {path}: {reason}")]
    Unrestorable { path: String, reason: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    pub policy: ConflictPolicy,
    pub name_rules: NameRules,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy, name_rules: NameRules) -> Self {
        Self { policy, name_rules }
    }

    /// `taken` reports whether a candidate path is already occupied on
    /// either side or by a planned job.
    pub fn resolve(
        &self,
        change: &Change,
        taken: &dyn Fn(&str) -> bool,
    ) -> Result<Resolution, ResolveError> {
        let Some(kind) = change.conflict_kind() else {
            return Ok(self.for_policy());
        };
        match kind {
            ConflictKind::EditEdit => Ok(self.for_policy()),
            ConflictKind::CaseClash => Ok(Resolution::RenameAndRetry {
                new_path: case_clash_path(&change.path, self.name_rules.max_len, taken),
            }),
            ConflictKind::InvalidName => {
                let parent = paths::parent_path(&change.path).unwrap_or("");
                let name = self.name_rules.sanitize_name(paths::file_name(&change.path));
                Ok(Resolution::RequiresUserChoice {
                    suggestion: Some(paths::join(parent, &name)),
                })
            }
            // A refused local edit is kept as a conflict copy.
            ConflictKind::PermissionLoss
                if change.remote.is_some()
                    && change.local.as_ref().is_some_and(|l| !l.is_dir()) =>
            {
                Ok(Resolution::KeepBoth)
            }
            ConflictKind::PermissionLoss if change.remote.is_some() => Ok(Resolution::KeepRemote),
            ConflictKind::PermissionLoss => Err(ResolveError::Unrestorable {
                path: change.path.clone(),
                reason: "server refuses the change and holds no copy to restore",
            }),
            ConflictKind::Inaccessible => Err(ResolveError::Unrestorable {
                path: change.path.clone(),
                reason: "local item cannot be read",
            }),
        }
    }

    fn for_policy(&self) -> Resolution {
        match self.policy {
            ConflictPolicy::KeepBoth => Resolution::KeepBoth,
            ConflictPolicy::Ask => Resolution::RequiresUserChoice { suggestion: None },
            ConflictPolicy::KeepLocal => Resolution::KeepLocal,
            ConflictPolicy::KeepRemote => Resolution::KeepRemote,
        }
    }

    /// Path for the local conflict copy of `path`. Collisions get a counter
    /// after the stamp.
    pub fn copy_path(&self, path: &str, stamp: &str, taken: &dyn Fn(&str) -> bool) -> String {
        let name = paths::file_name(path);
        first_free(path, taken, |n| {
            let label = if n == 1 {
                stamp.to_string()
            } else {
                format!("{stamp} {n}")
            };
            let copy = names::conflict_copy_name(name, &label, self.name_rules.max_len);
            match self.name_rules.validate_name(&copy) {
                Ok(()) => copy,
                Err(_) => self.name_rules.sanitize_name(&copy),
            }
        })
    }
}

/// Collision counters tried before falling back to a clock-based one.
const MAX_COUNTER: u64 = 1000;

/// First sibling of `path` named by `name_for(n)` that is not taken.
fn first_free(
    path: &str,
    taken: &dyn Fn(&str) -> bool,
    name_for: impl Fn(u64) -> String,
) -> String {
    let parent = paths::parent_path(path).unwrap_or("");
    let candidate = |n: u64| paths::join(parent, &name_for(n));
    if let Some(free) = (1..=MAX_COUNTER).map(candidate).find(|c| !taken(c)) {
        return free;
    }
    let n = OffsetDateTime::now_utc().unix_timestamp_nanos().unsigned_abs() as u64;
    tracing::warn!(path, "no free name after {MAX_COUNTER} candidates");
    candidate(n)
}

fn case_clash_path(path: &str, max_len: usize, taken: &dyn Fn(&str) -> bool) -> String {
    let name = paths::file_name(path);
    first_free(path, taken, |n| names::case_clash_name(name, n, max_len))
}

/// `YYYY-MM-DD HHMMSS` in UTC.
pub fn conflict_stamp(at: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day] [hour][minute][second]");
    at.format(&format)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}
