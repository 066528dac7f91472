use std::fs;

use async_trait::async_trait;

use super::*;
use crate::sync::conflict::{ConflictResolver, Resolution};
use crate::sync::discovery::ChangeKind;
use crate::sync::item::{Checksum, ChecksumAlgorithm, ItemRecord};
use crate::sync::journal::PinStates;
use crate::sync::local_walker::record_from_metadata;
use crate::sync::memory_remote::MemoryRemote;
use crate::sync::observer::NullObserver;
use crate::sync::planner::link_dependencies;
use crate::sync::transfer::TransferConfig;

const MODIFIED: i64 = 1_700_000_000;

struct FixedSpace(u64);

impl FreeSpace for FixedSpace {
    fn available(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

struct Decides(Resolution);

#[async_trait]
impl SyncObserver for Decides {
    async fn resolve_conflict(&self, _change: &Change, _suggestion: Option<&str>) -> Option<Resolution> {
        Some(self.0.clone())
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    remote: Arc<MemoryRemote>,
    journal: Arc<Journal>,
}

impl Fixture {
    async fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            remote: Arc::new(MemoryRemote::new()),
            journal: Arc::new(Journal::new("sqlite::memory:").await.unwrap()),
        }
    }

    fn propagator(&self, observer: Arc<dyn SyncObserver>, free: u64) -> Propagator {
        let plan = PlanOptions {
            local_root: self.dir.path().to_path_buf(),
            vfs: VfsMode::Off,
            pins: PinStates::default(),
            resolver: ConflictResolver::default(),
            stamp: "2024-01-02 030405".into(),
            case_insensitive: false,
            upload_conflict_copies: false,
        };
        let transfers = TransferClient::new(
            self.remote.clone(),
            self.journal.clone(),
            self.dir.path(),
            TransferConfig::default(),
        );
        Propagator::new(
            self.remote.clone(),
            self.journal.clone(),
            transfers,
            observer,
            Arc::new(FixedSpace(free)),
            Arc::new(plan),
            PropagatorConfig {
                parallelism: 2,
                move_to_trash: false,
                free_space_margin: 0,
            },
        )
    }

    fn write_local(&self, rel: &str, data: &[u8]) -> ItemRecord {
        let path = self.dir.path().join(rel);
        fs::write(&path, data).unwrap();
        let mut record = record_from_metadata(rel, &fs::metadata(&path).unwrap());
        record.checksum = Some(Checksum::of_bytes(ChecksumAlgorithm::Md5, data));
        record
    }

    /// Records the local item at `rel` as synced in the journal.
    async fn mark_synced(&self, rel: &str) -> ItemRecord {
        let path = self.dir.path().join(rel);
        let record = record_from_metadata(rel, &fs::metadata(&path).unwrap());
        self.journal
            .commit(&[JournalUpdate::Upsert(JournalEntry::synced(
                rel,
                Some(&record),
                &record,
            ))])
            .await
            .unwrap();
        record
    }

    async fn remote_record(&self, rel: &str) -> ItemRecord {
        self.remote.stat(rel).await.unwrap().unwrap()
    }
}

fn plan(steps: Vec<(&str, JobKind)>) -> Vec<Job> {
    let mut jobs: Vec<Job> = steps
        .into_iter()
        .enumerate()
        .map(|(id, (path, kind))| Job::new(id, path, kind))
        .collect();
    link_dependencies(&mut jobs);
    jobs
}

fn edit_edit(fx: &Fixture, path: &str, remote: ItemRecord) -> Change {
    Change {
        path: path.into(),
        kind: ChangeKind::Conflict {
            kind: ConflictKind::EditEdit,
            candidates: Vec::new(),
        },
        local: Some(fx.write_local(path, b"local edit")),
        remote: Some(remote),
        base: None,
    }
}

#[tokio::test]
async fn download_commits_journal_before_finishing() {
    let fx = Fixture::new().await;
    fx.remote.put_file("a.txt", b"remote", MODIFIED);
    let remote = fx.remote_record("a.txt").await;
    let jobs = plan(vec![(
        "a.txt",
        JobKind::Download {
            remote: remote.clone(),
            local: None,
        },
    )]);

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert_eq!(outcome.jobs[0].state, JobState::Done);
    assert_eq!(outcome.bytes_down, 6);
    let entry = fx.journal.get_entry("a.txt").await.unwrap().unwrap();
    assert_eq!(entry.checksum, remote.checksum);
    assert_ne!(entry.fingerprint, 0);
}

#[tokio::test]
async fn refused_remote_move_restores_local_item_and_skips_dependents() {
    let fx = Fixture::new().await;
    fx.remote.put_file("old.txt", b"data", MODIFIED);
    let moved = fx.write_local("new.txt", b"data");
    fx.remote.fail_moves_with(Some(StatusCode::CONFLICT));
    let jobs = plan(vec![
        (
            "new.txt",
            JobKind::RemoteMove {
                from: "old.txt".into(),
                local: Some(moved.clone()),
            },
        ),
        (
            "new.txt",
            JobKind::Upload {
                local: moved,
                remote: None,
            },
        ),
    ]);

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert!(matches!(outcome.jobs[0].state, JobState::Failed(_)));
    assert_eq!(
        outcome.jobs[1].state,
        JobState::Skipped(SkipReason::DependencyFailed)
    );
    assert_eq!(outcome.failures.len(), 1);
    assert!(fx.dir.path().join("old.txt").exists());
    assert!(!fx.dir.path().join("new.txt").exists());
    assert!(fx.remote.upload_calls().is_empty());
}

#[test]
fn schedule_releases_a_job_after_its_last_dependency() {
    let mut jobs = vec![
        Job::new(0, "a", JobKind::Forget),
        Job::new(1, "b", JobKind::Forget),
        Job::new(2, "c", JobKind::Forget),
    ];
    jobs[2].deps = vec![0, 1];
    let mut schedule = Schedule::new(&jobs);
    assert_eq!(schedule.ready.drain(..).collect::<Vec<_>>(), vec![0, 1]);

    assert!(schedule.settled(0, true).is_empty());
    assert!(schedule.ready.is_empty());
    assert!(schedule.settled(1, true).is_empty());
    assert_eq!(schedule.ready.pop_front(), Some(2));
}

#[tokio::test]
async fn failure_skips_a_long_chain_of_dependents() {
    let fx = Fixture::new().await;
    fx.remote.put_file("old.txt", b"data", MODIFIED);
    fx.remote.fail_moves_with(Some(StatusCode::CONFLICT));
    let mut jobs = vec![Job::new(
        0,
        "new.txt",
        JobKind::RemoteMove {
            from: "old.txt".into(),
            local: None,
        },
    )];
    for id in 1..2000 {
        let mut job = Job::new(id, format!("gone/{id}"), JobKind::Forget);
        job.deps = vec![id - 1];
        jobs.push(job);
    }

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert!(matches!(outcome.jobs[0].state, JobState::Failed(_)));
    assert!(
        outcome.jobs[1..]
            .iter()
            .all(|job| job.state == JobState::Skipped(SkipReason::DependencyFailed))
    );
    assert_eq!(outcome.failures.len(), 1);
}

#[tokio::test]
async fn downloads_beyond_free_space_are_skipped_and_blacklisted() {
    let fx = Fixture::new().await;
    fx.remote.put_file("big.bin", &[7u8; 200], MODIFIED);
    fx.remote.put_file("small.txt", b"0123456789", MODIFIED);
    let jobs = plan(vec![
        (
            "big.bin",
            JobKind::Download {
                remote: fx.remote_record("big.bin").await,
                local: None,
            },
        ),
        (
            "small.txt",
            JobKind::Download {
                remote: fx.remote_record("small.txt").await,
                local: None,
            },
        ),
    ]);

    let outcome = fx
        .propagator(Arc::new(NullObserver), 100)
        .run(jobs, &CancellationToken::new())
        .await;

    assert_eq!(
        outcome.jobs[0].state,
        JobState::Skipped(SkipReason::InsufficientLocalSpace)
    );
    assert_eq!(outcome.jobs[1].state, JobState::Done);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].kind, FailureKind::QuotaExceeded);
    assert!(!fx.dir.path().join("big.bin").exists());
}

#[tokio::test]
async fn uploads_beyond_quota_are_skipped() {
    let fx = Fixture::new().await;
    fx.remote.set_quota(Some(5));
    let local = fx.write_local("a.txt", b"0123456789");
    let jobs = plan(vec![("a.txt", JobKind::Upload { local, remote: None })]);

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert_eq!(
        outcome.jobs[0].state,
        JobState::Skipped(SkipReason::QuotaExceeded)
    );
    assert!(!fx.remote.contains("a.txt"));
}

#[tokio::test]
async fn local_delete_keeps_a_file_edited_after_discovery() {
    let fx = Fixture::new().await;
    let seen = fx.write_local("a.txt", b"v1");
    fs::write(fx.dir.path().join("a.txt"), b"edited again").unwrap();
    let jobs = plan(vec![("a.txt", JobKind::LocalDelete { local: seen })]);

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert_eq!(
        outcome.jobs[0].state,
        JobState::Skipped(SkipReason::ChangedDuringSync)
    );
    assert!(outcome.needs_followup);
    assert!(outcome.failures.is_empty());
    assert!(fx.dir.path().join("a.txt").exists());
}

#[tokio::test]
async fn remote_directory_delete_removes_synced_tree() {
    let fx = Fixture::new().await;
    fs::create_dir_all(fx.dir.path().join("D/sub")).unwrap();
    fs::write(fx.dir.path().join("D/sub/old.txt"), b"synced").unwrap();
    let dir = fx.mark_synced("D").await;
    fx.mark_synced("D/sub").await;
    fx.mark_synced("D/sub/old.txt").await;
    let jobs = plan(vec![("D", JobKind::LocalDelete { local: dir })]);

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert_eq!(outcome.jobs[0].state, JobState::Done);
    assert!(!fx.dir.path().join("D").exists());
    assert!(fx.journal.load_subtree("D").await.unwrap().is_empty());
}

#[tokio::test]
async fn remote_directory_delete_keeps_unsynced_local_work() {
    let fx = Fixture::new().await;
    fs::create_dir_all(fx.dir.path().join("D")).unwrap();
    fs::write(fx.dir.path().join("D/old.txt"), b"synced").unwrap();
    let dir = fx.mark_synced("D").await;
    fx.mark_synced("D/old.txt").await;
    fs::write(fx.dir.path().join("D/new-work.txt"), b"not synced yet").unwrap();
    let jobs = plan(vec![("D", JobKind::LocalDelete { local: dir })]);

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert_eq!(
        outcome.jobs[0].state,
        JobState::Skipped(SkipReason::ChangedDuringSync)
    );
    assert!(outcome.needs_followup);
    assert_eq!(
        fs::read(fx.dir.path().join("D/new-work.txt")).unwrap(),
        b"not synced yet"
    );
    assert_eq!(fx.journal.load_subtree("D").await.unwrap().len(), 2);
}

#[tokio::test]
async fn unanswered_conflict_is_recorded_and_left_alone() {
    let fx = Fixture::new().await;
    fx.remote.put_file("a.txt", b"remote", MODIFIED);
    let change = edit_edit(&fx, "a.txt", fx.remote_record("a.txt").await);
    let jobs = plan(vec![(
        "a.txt",
        JobKind::AwaitChoice {
            change,
            suggestion: None,
        },
    )]);

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert_eq!(
        outcome.jobs[0].state,
        JobState::Skipped(SkipReason::AwaitingUserChoice)
    );
    let conflicts = fx.journal.list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, "edit_edit");
    assert_eq!(fs::read(fx.dir.path().join("a.txt")).unwrap(), b"local edit");
}

#[tokio::test]
async fn user_choice_is_carried_out() {
    let fx = Fixture::new().await;
    fx.remote.put_file("a.txt", b"remote", MODIFIED);
    let change = edit_edit(&fx, "a.txt", fx.remote_record("a.txt").await);
    let jobs = plan(vec![(
        "a.txt",
        JobKind::AwaitChoice {
            change,
            suggestion: None,
        },
    )]);

    let outcome = fx
        .propagator(Arc::new(Decides(Resolution::KeepBoth)), u64::MAX)
        .run(jobs, &CancellationToken::new())
        .await;

    assert_eq!(outcome.jobs[0].state, JobState::Done);
    assert_eq!(fs::read(fx.dir.path().join("a.txt")).unwrap(), b"remote");
    let copy = fx
        .dir
        .path()
        .join("a (conflicted copy 2024-01-02 030405).txt");
    assert_eq!(fs::read(copy).unwrap(), b"local edit");
    let conflicts = fx.journal.list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(
        conflicts[0].renamed_local.as_deref(),
        Some("a (conflicted copy 2024-01-02 030405).txt")
    );
}

#[tokio::test]
async fn cancelled_run_starts_nothing() {
    let fx = Fixture::new().await;
    let local = fx.write_local("a.txt", b"abc");
    let jobs = plan(vec![("a.txt", JobKind::Upload { local, remote: None })]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = fx
        .propagator(Arc::new(NullObserver), u64::MAX)
        .run(jobs, &cancel)
        .await;

    assert_eq!(outcome.jobs[0].state, JobState::Skipped(SkipReason::Cancelled));
    assert!(fx.remote.upload_calls().is_empty());
}
