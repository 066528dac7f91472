use super::*;
use crate::sync::conflict::ConflictPolicy;
use crate::sync::names::NameRules;

fn options(root: &std::path::Path) -> PlanOptions {
    PlanOptions {
        local_root: root.to_path_buf(),
        vfs: VfsMode::Off,
        pins: PinStates::default(),
        resolver: ConflictResolver::new(ConflictPolicy::KeepBoth, NameRules::default()),
        stamp: "2024-01-02 030405".into(),
        case_insensitive: false,
        upload_conflict_copies: true,
    }
}

fn file(path: &str) -> ItemRecord {
    ItemRecord::file(path, 3, 1_700_000_000)
}

fn change(path: &str, kind: ChangeKind, local: Option<ItemRecord>, remote: Option<ItemRecord>) -> Change {
    Change {
        path: path.into(),
        kind,
        local,
        remote,
        base: None,
    }
}

fn conflict(kind: ConflictKind) -> ChangeKind {
    ChangeKind::Conflict {
        kind,
        candidates: Vec::new(),
    }
}

fn run(options: &PlanOptions, changes: &[Change]) -> Plan {
    Planner::new(options, &BTreeMap::new(), 0).plan(changes)
}

fn summary(plan: &Plan) -> Vec<(&'static str, &str, Vec<JobId>)> {
    plan.jobs
        .iter()
        .map(|job| (job.kind.name(), job.path.as_str(), job.deps.clone()))
        .collect()
}

#[test]
fn one_sided_changes_map_to_transfers() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let changes = vec![
        change("a.txt", ChangeKind::LocalNew, Some(file("a.txt")), None),
        change("b.txt", ChangeKind::RemoteNew, None, Some(file("b.txt"))),
        change("c.txt", ChangeKind::LocalDeleted, None, Some(file("c.txt"))),
        change("d.txt", ChangeKind::RemoteDeleted, Some(file("d.txt")), None),
        change("e.txt", ChangeKind::Forget, None, None),
    ];

    let plan = run(&opts, &changes);

    assert_eq!(
        summary(&plan),
        vec![
            ("upload", "a.txt", vec![]),
            ("download", "b.txt", vec![]),
            ("remote_delete", "c.txt", vec![]),
            ("local_delete", "d.txt", vec![]),
            ("forget", "e.txt", vec![]),
        ]
    );
    assert!(!plan.needs_followup);
}

#[test]
fn children_wait_for_their_directory() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let changes = vec![
        change("N", ChangeKind::LocalNew, Some(ItemRecord::dir("N")), None),
        change("N/deep", ChangeKind::LocalNew, Some(ItemRecord::dir("N/deep")), None),
        change("N/deep/f.txt", ChangeKind::LocalNew, Some(file("N/deep/f.txt")), None),
    ];

    let plan = run(&opts, &changes);

    assert_eq!(
        summary(&plan),
        vec![
            ("remote_mkdir", "N", vec![]),
            ("remote_mkdir", "N/deep", vec![0]),
            ("upload", "N/deep/f.txt", vec![1]),
        ]
    );
}

#[test]
fn directory_deletion_waits_for_moves_out_of_it() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let changes = vec![
        change("Old", ChangeKind::LocalDeleted, None, Some(ItemRecord::dir("Old"))),
        change(
            "a.txt",
            ChangeKind::LocalRenamed {
                from: "Old/a.txt".into(),
                to: "a.txt".into(),
            },
            Some(file("a.txt")),
            Some(file("a.txt")),
        ),
    ];

    let plan = run(&opts, &changes);

    assert_eq!(
        summary(&plan),
        vec![("remote_delete", "Old", vec![1]), ("remote_move", "a.txt", vec![])]
    );
}

#[test]
fn deletion_waits_only_for_jobs_inside_the_directory() {
    let mut jobs = vec![
        Job::new(0, "D", JobKind::RemoteDelete { remote: ItemRecord::dir("D") }),
        Job::new(1, "D-1/x", JobKind::Forget),
        Job::new(2, "D/a", JobKind::Forget),
        Job::new(3, "D0", JobKind::Forget),
        Job::new(
            4,
            "b.txt",
            JobKind::RemoteMove {
                from: "D/sub/b.txt".into(),
                local: None,
            },
        ),
        Job::new(5, "D/sub/deep/c", JobKind::Forget),
    ];

    link_dependencies(&mut jobs);

    assert_eq!(jobs[0].deps, vec![2, 4, 5]);
    assert!(jobs[1].deps.is_empty());
    assert!(jobs[3].deps.is_empty());
}

#[test]
fn keep_both_steps_aside_then_downloads() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let changes = vec![change(
        "Docs/a.txt",
        conflict(ConflictKind::EditEdit),
        Some(file("Docs/a.txt")),
        Some(file("Docs/a.txt")),
    )];

    let plan = run(&opts, &changes);

    let copy = "Docs/a (conflicted copy 2024-01-02 030405).txt";
    assert_eq!(
        summary(&plan),
        vec![
            ("local_move", copy, vec![]),
            ("download", "Docs/a.txt", vec![0]),
            ("upload", copy, vec![0]),
        ]
    );
    assert_eq!(plan.jobs[0].conflict, Some(ConflictKind::EditEdit));
    assert_eq!(plan.jobs[0].kind.move_source(), Some("Docs/a.txt"));
    match &plan.jobs[1].kind {
        JobKind::Download { local, .. } => assert!(local.is_none()),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn keep_both_skips_existing_copy_names() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a (conflicted copy 2024-01-02 030405).txt"),
        b"older copy",
    )
    .unwrap();
    let mut opts = options(dir.path());
    opts.upload_conflict_copies = false;
    let changes = vec![change(
        "a.txt",
        conflict(ConflictKind::EditEdit),
        Some(file("a.txt")),
        Some(file("a.txt")),
    )];

    let plan = run(&opts, &changes);

    assert_eq!(plan.jobs.len(), 2);
    assert_eq!(plan.jobs[0].path, "a (conflicted copy 2024-01-02 030405 2).txt");
}

#[test]
fn policies_pick_a_winner() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path());
    let changes = vec![change(
        "a.txt",
        conflict(ConflictKind::EditEdit),
        Some(file("a.txt")),
        Some(file("a.txt")),
    )];

    opts.resolver.policy = ConflictPolicy::KeepRemote;
    assert_eq!(summary(&run(&opts, &changes)), vec![("download", "a.txt", vec![])]);

    opts.resolver.policy = ConflictPolicy::KeepLocal;
    assert_eq!(summary(&run(&opts, &changes)), vec![("upload", "a.txt", vec![])]);

    opts.resolver.policy = ConflictPolicy::Ask;
    let plan = run(&opts, &changes);
    assert_eq!(summary(&plan), vec![("await_choice", "a.txt", vec![])]);
}

#[test]
fn local_type_change_replaces_remote_item() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let changes = vec![change(
        "X",
        ChangeKind::LocalModified,
        Some(ItemRecord::dir("X")),
        Some(file("X")),
    )];

    let plan = run(&opts, &changes);

    assert_eq!(
        summary(&plan),
        vec![("remote_delete", "X", vec![]), ("remote_mkdir", "X", vec![0])]
    );
    assert!(plan.needs_followup);
}

#[test]
fn case_clash_renames_the_later_item() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path());
    opts.case_insensitive = true;
    let changes = vec![
        change("A.txt", ChangeKind::RemoteNew, None, Some(file("A.txt"))),
        change(
            "a.txt",
            ChangeKind::Conflict {
                kind: ConflictKind::CaseClash,
                candidates: vec!["A.txt".into()],
            },
            Some(file("a.txt")),
            None,
        ),
    ];

    let plan = run(&opts, &changes);

    assert_eq!(
        summary(&plan),
        vec![
            ("download", "A.txt", vec![]),
            ("local_move", "a (case clash 1).txt", vec![]),
        ]
    );
    assert!(plan.needs_followup);
}

#[test]
fn unrestorable_conflicts_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let changes = vec![change(
        "Secret",
        conflict(ConflictKind::Inaccessible),
        None,
        Some(ItemRecord::dir("Secret")),
    )];

    let plan = run(&opts, &changes);

    assert!(plan.jobs.is_empty());
    assert_eq!(plan.unresolved.len(), 1);
    assert_eq!(plan.unresolved[0].kind, FailureKind::LocalIo);
}

#[test]
fn unpinned_remote_files_become_placeholders() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path());
    opts.vfs = VfsMode::Suffix;
    opts.pins.0.insert("Pinned".into(), true);
    let changes = vec![
        change("Pinned/a.txt", ChangeKind::RemoteNew, None, Some(file("Pinned/a.txt"))),
        change("b.txt", ChangeKind::RemoteNew, None, Some(file("b.txt"))),
    ];

    let plan = run(&opts, &changes);

    let kinds: Vec<_> = plan.jobs.iter().map(|job| job.kind.name()).collect();
    assert_eq!(kinds, vec!["download", "write_placeholder"]);
}

#[test]
fn pinning_a_placeholder_hydrates_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path());
    opts.vfs = VfsMode::Suffix;
    opts.pins.0.insert("a.txt".into(), true);
    let mut placeholder = file("a.txt");
    placeholder.placeholder = true;
    let changes = vec![change("a.txt", ChangeKind::Unchanged, Some(placeholder), Some(file("a.txt")))];

    let plan = run(&opts, &changes);

    assert_eq!(summary(&plan), vec![("download", "a.txt", vec![])]);
}

#[test]
fn blacklisted_paths_wait_for_their_retry_time() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let entry = |path: &str, next_retry_at| BlacklistEntry {
        path: path.into(),
        kind: FailureKind::Transient,
        reason: "boom".into(),
        retry_count: 1,
        next_retry_at,
        first_failure_at: 0,
        last_failure_at: 0,
    };
    let mut blacklist = BTreeMap::new();
    blacklist.insert("later.txt".to_string(), entry("later.txt", Some(500)));
    blacklist.insert("due.txt".to_string(), entry("due.txt", Some(50)));
    let changes = vec![
        change("due.txt", ChangeKind::LocalNew, Some(file("due.txt")), None),
        change("later.txt", ChangeKind::LocalNew, Some(file("later.txt")), None),
    ];

    let plan = Planner::new(&opts, &blacklist, 100).plan(&changes);

    assert_eq!(plan.jobs[0].state, JobState::Pending);
    assert_eq!(plan.jobs[1].state, JobState::Skipped(SkipReason::Blacklisted));
}
