use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::item::ItemRecord;
use super::journal::JournalEntry;
use super::local_walker::LocalSnapshot;
use super::names::NameRules;
use super::paths;

/// How local renames are recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenameDetection {
    Off,
    /// The fingerprint of a vanished item reappears on a new path.
    #[default]
    Inode,
    /// Inode matching, then a vanished file pairs with exactly one new file
    /// of identical size and checksum.
    InodeOrContent,
}

impl RenameDetection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(RenameDetection::Off),
            "inode" => Some(RenameDetection::Inode),
            "inode-or-content" | "content" => Some(RenameDetection::InodeOrContent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    EditEdit,
    CaseClash,
    InvalidName,
    PermissionLoss,
    Inaccessible,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::EditEdit => "edit_edit",
            ConflictKind::CaseClash => "case_clash",
            ConflictKind::InvalidName => "invalid_name",
            ConflictKind::PermissionLoss => "permission_loss",
            ConflictKind::Inaccessible => "inaccessible",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Unchanged,
    LocalNew,
    LocalModified,
    LocalDeleted,
    LocalRenamed { from: String, to: String },
    RemoteNew,
    RemoteModified,
    RemoteDeleted,
    RemoteRenamed { from: String, to: String },
    Conflict {
        kind: ConflictKind,
        candidates: Vec<String>,
    },
    /// Both sides agree; only the journal row needs refreshing.
    UpdateMetadata,
    /// Gone on both sides; drop the journal row.
    Forget,
}

/// The verdict for one path. Records are snapshots, keyed at `path`; for
/// renames the baseline and the other side are re-keyed to the new path.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
    pub local: Option<ItemRecord>,
    pub remote: Option<ItemRecord>,
    pub base: Option<JournalEntry>,
}

impl Change {
    pub fn is_dir(&self) -> bool {
        self.local.as_ref().is_some_and(ItemRecord::is_dir)
            || self.remote.as_ref().is_some_and(ItemRecord::is_dir)
            || self.base.as_ref().is_some_and(JournalEntry::is_dir)
    }

    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match &self.kind {
            ChangeKind::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub rename_detection: RenameDetection,
    pub case_insensitive: bool,
    pub name_rules: NameRules,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            rename_detection: RenameDetection::default(),
            case_insensitive: cfg!(any(target_os = "macos", target_os = "windows")),
            name_rules: NameRules::default(),
        }
    }
}

/// Did the local item change since it was last synchronized?
pub fn local_changed(local: &ItemRecord, base: &JournalEntry) -> bool {
    if local.item_type != base.item_type {
        return true;
    }
    if local.is_dir() {
        return false;
    }
    if local.size != base.size {
        return true;
    }
    let same_stat = local.modified == base.modified
        && (base.fingerprint == 0 || local.fingerprint == base.fingerprint);
    if same_stat {
        return false;
    }
    match local.checksum_matches(&base.to_record()) {
        Some(equal) => !equal,
        None => true,
    }
}

/// Did the remote item change since it was last synchronized?
pub fn remote_changed(remote: &ItemRecord, base: &JournalEntry) -> bool {
    if remote.item_type != base.item_type {
        return true;
    }
    if remote.is_dir() {
        return false;
    }
    match remote.checksum_matches(&base.to_record()) {
        Some(equal) => !equal,
        None => remote.size != base.size || remote.modified != base.modified,
    }
}

fn metadata_moved(local: &ItemRecord, remote: &ItemRecord, base: &JournalEntry) -> bool {
    let file_times = !base.is_dir()
        && (local.modified != base.modified || remote.modified != base.modified);
    let fingerprint = base.fingerprint != 0 && local.fingerprint != base.fingerprint;
    file_times
        || fingerprint
        || remote.permissions != base.permissions
        || remote.resource_id != base.resource_id
}

/// Three-way diff of the local snapshot, the remote snapshot and the journal.
/// Produces exactly one change per path that is not covered by a pruned
/// directory, in path order.
pub fn discover(
    local: &LocalSnapshot,
    remote: &BTreeMap<String, ItemRecord>,
    journal: &BTreeMap<String, JournalEntry>,
    options: &DiscoveryOptions,
) -> Vec<Change> {
    let mut state = Discovery {
        local: local.items.clone(),
        remote: remote.clone(),
        base: journal.clone(),
        inaccessible: &local.inaccessible,
        options,
        renames: BTreeMap::new(),
        case_clashes: HashMap::new(),
    };
    state.detect_remote_renames();
    if options.rename_detection != RenameDetection::Off {
        state.detect_local_renames();
    }
    if options.case_insensitive {
        state.detect_case_clashes();
    }
    state.diff()
}

struct Discovery<'a> {
    local: BTreeMap<String, ItemRecord>,
    remote: BTreeMap<String, ItemRecord>,
    base: BTreeMap<String, JournalEntry>,
    inaccessible: &'a BTreeSet<String>,
    options: &'a DiscoveryOptions,
    /// Keyed by the new path.
    renames: BTreeMap<String, ChangeKind>,
    /// Second-arriving path -> the path it clashes with.
    case_clashes: HashMap<String, String>,
}

impl Discovery<'_> {
    fn detect_remote_renames(&mut self) {
        loop {
            let by_id: HashMap<String, String> = self
                .remote
                .iter()
                .filter_map(|(path, r)| r.resource_id.clone().map(|id| (id, path.clone())))
                .collect();
            let found = self.base.values().find_map(|b| {
                let to = by_id.get(b.resource_id.as_ref()?)?;
                (to != &b.path && self.remote_rename_valid(b, to)).then(|| (b.path.clone(), to.clone()))
            });
            let Some((from, to)) = found else {
                break;
            };
            tracing::debug!(from = %from, to = %to, "remote rename detected");
            rebase_tree(&mut self.base, &from, &to, |entry, path| entry.path = path);
            rebase_tree(&mut self.local, &from, &to, |record, path| record.path = path);
            self.renames
                .insert(to.clone(), ChangeKind::RemoteRenamed { from, to });
        }
    }

    fn remote_rename_valid(&self, base: &JournalEntry, to: &str) -> bool {
        if paths::is_descendant(to, &base.path)
            || self.base.contains_key(to)
            || self.local.contains_key(to)
            || self.renames.contains_key(&base.path)
        {
            return false;
        }
        match self.local.get(&base.path) {
            Some(local) => !local_changed(local, base),
            None => false,
        }
    }

    fn detect_local_renames(&mut self) {
        let mut claimed: HashSet<String> = HashSet::new();
        loop {
            let Some((from, to)) = self.next_inode_rename(&claimed) else {
                break;
            };
            claimed.insert(to.clone());
            self.accept_local_rename(from, to);
        }
        if self.options.rename_detection == RenameDetection::InodeOrContent {
            for (from, to) in self.content_renames(&claimed) {
                if self.base.contains_key(&from) && self.local_rename_valid(&from, &to) {
                    self.accept_local_rename(from, to);
                }
            }
        }
    }

    fn next_inode_rename(&self, claimed: &HashSet<String>) -> Option<(String, String)> {
        let mut by_fingerprint: HashMap<u64, Vec<&ItemRecord>> = HashMap::new();
        for (path, record) in &self.local {
            if record.fingerprint != 0 && !self.base.contains_key(path) && !claimed.contains(path) {
                by_fingerprint.entry(record.fingerprint).or_default().push(record);
            }
        }
        self.base.values().find_map(|b| {
            if b.fingerprint == 0 || self.local.contains_key(&b.path) {
                return None;
            }
            let candidates: Vec<_> = by_fingerprint
                .get(&b.fingerprint)?
                .iter()
                .filter(|record| record.item_type == b.item_type)
                .collect();
            match candidates.as_slice() {
                [only] if self.local_rename_valid(&b.path, &only.path) => {
                    Some((b.path.clone(), only.path.clone()))
                }
                _ => None,
            }
        })
    }

    /// Vanished files paired with new files by size and checksum. Only
    /// one-to-one pairings count.
    fn content_renames(&self, claimed: &HashSet<String>) -> Vec<(String, String)> {
        let vanished: Vec<&JournalEntry> = self
            .base
            .values()
            .filter(|b| !b.is_dir() && b.checksum.is_some() && !self.local.contains_key(&b.path))
            .collect();
        let fresh: Vec<&ItemRecord> = self
            .local
            .values()
            .filter(|l| {
                !l.is_dir()
                    && l.checksum.is_some()
                    && !self.base.contains_key(&l.path)
                    && !claimed.contains(&l.path)
            })
            .collect();
        let mut pairs = Vec::new();
        for b in &vanished {
            let candidates: Vec<_> = fresh.iter().filter(|l| same_file(b, l)).collect();
            let [only] = candidates.as_slice() else {
                continue;
            };
            let rivals = vanished.iter().filter(|other| same_file(other, only)).count();
            if rivals == 1 {
                pairs.push((b.path.clone(), only.path.clone()));
            }
        }
        pairs
    }

    fn local_rename_valid(&self, from: &str, to: &str) -> bool {
        if paths::is_descendant(to, from)
            || self.base.contains_key(to)
            || self.remote.contains_key(to)
            || self.renames.contains_key(from)
            || self
                .options
                .name_rules
                .validate_name(paths::file_name(to))
                .is_err()
        {
            return false;
        }
        let (Some(base), Some(remote)) = (self.base.get(from), self.remote.get(from)) else {
            return false;
        };
        if remote_changed(remote, base) {
            return false;
        }
        match &remote.permissions {
            Some(perms) => perms.can_rename() || perms.can_move(),
            None => true,
        }
    }

    fn accept_local_rename(&mut self, from: String, to: String) {
        tracing::debug!(from = %from, to = %to, "local rename detected");
        rebase_tree(&mut self.base, &from, &to, |entry, path| entry.path = path);
        rebase_tree(&mut self.remote, &from, &to, |record, path| record.path = path);
        self.renames
            .insert(to.clone(), ChangeKind::LocalRenamed { from, to });
    }

    /// Remote items arrive first, then local ones, each in path order.
    fn detect_case_clashes(&mut self) {
        let mut first_seen: HashMap<String, String> = HashMap::new();
        let unsynced = self
            .remote
            .keys()
            .chain(self.local.keys())
            .filter(|path| !self.base.contains_key(*path));
        for path in unsynced {
            let key = paths::case_key(path);
            match first_seen.get(&key) {
                Some(first) if first != path => {
                    self.case_clashes
                        .entry(path.clone())
                        .or_insert_with(|| first.clone());
                }
                Some(_) => {}
                None => {
                    first_seen.insert(key, path.clone());
                }
            }
        }
    }

    fn diff(&self) -> Vec<Change> {
        let mut keys: BTreeSet<&String> = BTreeSet::new();
        keys.extend(self.local.keys());
        keys.extend(self.remote.keys());
        keys.extend(self.base.keys());
        keys.extend(self.inaccessible.iter());

        let mut pruned: HashSet<&str> = HashSet::new();
        let mut changes = Vec::new();
        for path in keys {
            if has_pruned_ancestor(&pruned, path) {
                continue;
            }
            let local = self.local.get(path);
            let remote = self.remote.get(path);
            let base = self.base.get(path);
            let (kind, prune) = if self.inaccessible.contains(path) {
                (conflict(ConflictKind::Inaccessible), true)
            } else if let Some(rename) = self.renames.get(path) {
                (rename.clone(), false)
            } else {
                self.classify(path, local, remote, base)
            };
            if prune {
                pruned.insert(path);
            }
            changes.push(Change {
                path: path.clone(),
                kind,
                local: local.cloned(),
                remote: remote.cloned(),
                base: base.cloned(),
            });
        }
        changes
    }

    fn classify(
        &self,
        path: &str,
        local: Option<&ItemRecord>,
        remote: Option<&ItemRecord>,
        base: Option<&JournalEntry>,
    ) -> (ChangeKind, bool) {
        match (local, remote, base) {
            (None, None, None) => (ChangeKind::Unchanged, false),
            (Some(l), None, None) => match self.check_new_local(path, l) {
                Some(kind) => (kind, true),
                None => (ChangeKind::LocalNew, false),
            },
            (None, Some(_), None) => match self.case_clashes.get(path) {
                Some(first) => (case_clash(first), true),
                None => (ChangeKind::RemoteNew, false),
            },
            (Some(l), Some(r), None) => {
                if l.is_dir() && r.is_dir() {
                    (ChangeKind::UpdateMetadata, false)
                } else if l.item_type == r.item_type && l.same_content(r) {
                    (ChangeKind::UpdateMetadata, false)
                } else {
                    (conflict(ConflictKind::EditEdit), l.item_type != r.item_type)
                }
            }
            (None, None, Some(b)) => (ChangeKind::Forget, b.is_dir()),
            (None, Some(r), Some(b)) => {
                if remote_changed(r, b) || (r.is_dir() && self.remote_subtree_changed(path)) {
                    (ChangeKind::RemoteNew, false)
                } else if r.permissions.as_ref().is_some_and(|p| !p.can_delete()) {
                    (conflict(ConflictKind::PermissionLoss), true)
                } else {
                    (ChangeKind::LocalDeleted, r.is_dir())
                }
            }
            (Some(l), None, Some(b)) => {
                if local_changed(l, b) || (l.is_dir() && self.local_subtree_changed(path)) {
                    match self.check_new_local(path, l) {
                        Some(kind) => (kind, true),
                        None => (ChangeKind::LocalNew, false),
                    }
                } else {
                    (ChangeKind::RemoteDeleted, l.is_dir())
                }
            }
            (Some(l), Some(r), Some(b)) => {
                let type_changed = l.item_type != r.item_type;
                match (local_changed(l, b), remote_changed(r, b)) {
                    (true, true) => {
                        if !type_changed && !l.is_dir() && l.same_content(r) {
                            (ChangeKind::UpdateMetadata, false)
                        } else {
                            (conflict(ConflictKind::EditEdit), type_changed)
                        }
                    }
                    (true, false) => {
                        if !r.is_dir() && r.permissions.as_ref().is_some_and(|p| !p.can_write()) {
                            (conflict(ConflictKind::PermissionLoss), type_changed)
                        } else {
                            (ChangeKind::LocalModified, type_changed)
                        }
                    }
                    (false, true) => (ChangeKind::RemoteModified, type_changed),
                    (false, false) if metadata_moved(l, r, b) => (ChangeKind::UpdateMetadata, false),
                    (false, false) => (ChangeKind::Unchanged, false),
                }
            }
        }
    }

    /// Problems that keep a local item from being created on the server.
    fn check_new_local(&self, path: &str, local: &ItemRecord) -> Option<ChangeKind> {
        if self
            .options
            .name_rules
            .validate_name(paths::file_name(path))
            .is_err()
        {
            return Some(conflict(ConflictKind::InvalidName));
        }
        if let Some(first) = self.case_clashes.get(path) {
            return Some(case_clash(first));
        }
        let parent = paths::parent_path(path).filter(|p| !p.is_empty())?;
        let perms = self.remote.get(parent)?.permissions.as_ref()?;
        let allowed = if local.is_dir() {
            perms.can_add_subdir()
        } else {
            perms.can_add_file()
        };
        (!allowed).then(|| conflict(ConflictKind::PermissionLoss))
    }

    fn remote_subtree_changed(&self, dir: &str) -> bool {
        subtree(&self.remote, dir).any(|(path, r)| match self.base.get(path) {
            Some(b) => remote_changed(r, b),
            None => true,
        })
    }

    fn local_subtree_changed(&self, dir: &str) -> bool {
        subtree(&self.local, dir).any(|(path, l)| match self.base.get(path) {
            Some(b) => local_changed(l, b),
            None => true,
        }) || self
            .inaccessible
            .iter()
            .any(|path| paths::is_descendant(path, dir))
    }
}

fn same_file(base: &JournalEntry, local: &ItemRecord) -> bool {
    base.size == local.size && local.checksum_matches(&base.to_record()) == Some(true)
}

fn conflict(kind: ConflictKind) -> ChangeKind {
    ChangeKind::Conflict {
        kind,
        candidates: Vec::new(),
    }
}

fn case_clash(first: &str) -> ChangeKind {
    ChangeKind::Conflict {
        kind: ConflictKind::CaseClash,
        candidates: vec![first.to_string()],
    }
}

fn has_pruned_ancestor(pruned: &HashSet<&str>, path: &str) -> bool {
    let mut current = paths::parent_path(path);
    while let Some(parent) = current {
        if parent.is_empty() {
            return false;
        }
        if pruned.contains(parent) {
            return true;
        }
        current = paths::parent_path(parent);
    }
    false
}

/// Strict descendants of `dir`, which form one contiguous key range.
fn subtree<'m, V>(
    map: &'m BTreeMap<String, V>,
    dir: &str,
) -> impl Iterator<Item = (&'m String, &'m V)> + 'm {
    let prefix = format!("{dir}/");
    map.range(prefix.clone()..)
        .take_while(move |(path, _)| path.starts_with(&prefix))
}

/// Moves `from` and its subtree to `to`, updating the stored path as well.
fn rebase_tree<V>(
    map: &mut BTreeMap<String, V>,
    from: &str,
    to: &str,
    mut set_path: impl FnMut(&mut V, String),
) {
    let moved: Vec<String> = map
        .keys()
        .filter(|path| paths::is_same_or_descendant(path, from))
        .cloned()
        .collect();
    for old in moved {
        let Some(mut value) = map.remove(&old) else {
            continue;
        };
        let Some(new_path) = paths::rebase(&old, from, to) else {
            continue;
        };
        set_path(&mut value, new_path.clone());
        map.insert(new_path, value);
    }
}

#[cfg(test)]
#[path = "discovery_tests.rs"]
mod tests;
