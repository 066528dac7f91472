use std::fmt;

use super::discovery::ConflictKind;
use super::item::ItemRecord;
use super::journal::JournalEntry;

pub type JobId = usize;

/// Why a job failed. Drives the blacklist and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network trouble, timeouts, 5xx and 429. Retried with backoff.
    Transient,
    QuotaExceeded,
    NameInvalid,
    Conflict,
    PermissionDenied,
    /// Terminal for the item's subtree.
    LocalIo,
    ChecksumMismatch,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::NameInvalid => "name_invalid",
            FailureKind::Conflict => "conflict",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::LocalIo => "local_io",
            FailureKind::ChecksumMismatch => "checksum_mismatch",
            FailureKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "transient" => FailureKind::Transient,
            "quota_exceeded" => FailureKind::QuotaExceeded,
            "name_invalid" => FailureKind::NameInvalid,
            "conflict" => FailureKind::Conflict,
            "permission_denied" => FailureKind::PermissionDenied,
            "local_io" => FailureKind::LocalIo,
            "checksum_mismatch" => FailureKind::ChecksumMismatch,
            "cancelled" => FailureKind::Cancelled,
            _ => return None,
        })
    }

    /// Blacklisted without a retry time: only a user action clears it.
    pub fn waits_for_user(&self) -> bool {
        matches!(self, FailureKind::QuotaExceeded)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Blacklisted,
    DependencyFailed,
    InsufficientLocalSpace,
    QuotaExceeded,
    ChangedDuringSync,
    AwaitingUserChoice,
    Cancelled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Blacklisted => "blacklisted",
            SkipReason::DependencyFailed => "dependency_failed",
            SkipReason::InsufficientLocalSpace => "insufficient_local_space",
            SkipReason::QuotaExceeded => "quota_exceeded",
            SkipReason::ChangedDuringSync => "changed_during_sync",
            SkipReason::AwaitingUserChoice => "awaiting_user_choice",
            SkipReason::Cancelled => "cancelled",
        }
    }

    /// Skips that are persisted so the item is not retried until the user acts.
    pub fn blacklist_kind(&self) -> Option<FailureKind> {
        match self {
            SkipReason::InsufficientLocalSpace | SkipReason::QuotaExceeded => {
                Some(FailureKind::QuotaExceeded)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed(FailureKind),
    Skipped(SkipReason),
}

/// Every kind of propagation work. `Propagator::execute` is the single
/// dispatch point.
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// Fetch remote content over the local path. `local` is the record seen
    /// at discovery, re-checked before the final rename.
    Download {
        remote: ItemRecord,
        local: Option<ItemRecord>,
    },
    WritePlaceholder {
        remote: ItemRecord,
        local: Option<ItemRecord>,
    },
    Upload {
        local: ItemRecord,
        remote: Option<ItemRecord>,
    },
    LocalMkdir {
        remote: ItemRecord,
    },
    RemoteMkdir {
        local: ItemRecord,
    },
    LocalDelete {
        local: ItemRecord,
    },
    RemoteDelete {
        remote: ItemRecord,
    },
    /// Local move `from` -> job path. With `remote` it mirrors a remote
    /// rename and re-keys the journal; without, it only steps the local item
    /// aside (conflict copies, case clashes).
    LocalMove {
        from: String,
        remote: Option<ItemRecord>,
    },
    /// Remote move `from` -> job path, mirroring a local rename when
    /// `local` is set.
    RemoteMove {
        from: String,
        local: Option<ItemRecord>,
    },
    UpdateMetadata {
        entry: JournalEntry,
    },
    Forget,
    /// Conflict waiting for a decision from the observer.
    AwaitChoice {
        change: super::discovery::Change,
        suggestion: Option<String>,
    },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Download { .. } => "download",
            JobKind::WritePlaceholder { .. } => "write_placeholder",
            JobKind::Upload { .. } => "upload",
            JobKind::LocalMkdir { .. } => "local_mkdir",
            JobKind::RemoteMkdir { .. } => "remote_mkdir",
            JobKind::LocalDelete { .. } => "local_delete",
            JobKind::RemoteDelete { .. } => "remote_delete",
            JobKind::LocalMove { .. } => "local_move",
            JobKind::RemoteMove { .. } => "remote_move",
            JobKind::UpdateMetadata { .. } => "update_metadata",
            JobKind::Forget => "forget",
            JobKind::AwaitChoice { .. } => "await_choice",
        }
    }

    /// Jobs that create or move a directory other jobs may live under.
    pub fn is_structural(&self) -> bool {
        match self {
            JobKind::LocalMkdir { .. } | JobKind::RemoteMkdir { .. } => true,
            JobKind::LocalMove { .. } | JobKind::RemoteMove { .. } => true,
            JobKind::AwaitChoice { .. } => true,
            _ => false,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            JobKind::LocalDelete { .. } | JobKind::RemoteDelete { .. } | JobKind::Forget
        )
    }

    pub fn move_source(&self) -> Option<&str> {
        match self {
            JobKind::LocalMove { from, .. } | JobKind::RemoteMove { from, .. } => Some(from),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Target path of the job.
    pub path: String,
    pub kind: JobKind,
    pub deps: Vec<JobId>,
    pub state: JobState,
    /// Set on the one job that settles a conflict; recorded when it succeeds.
    pub conflict: Option<ConflictKind>,
}

impl Job {
    pub fn new(id: JobId, path: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id,
            path: path.into(),
            kind,
            deps: Vec::new(),
            state: JobState::Pending,
            conflict: None,
        }
    }
}
