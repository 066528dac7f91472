use std::collections::{BTreeMap, BTreeSet};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use walkdir::WalkDir;

use super::exclude::ExclusionList;
use super::item::{Checksum, ChecksumAlgorithm, ItemRecord, ItemType};
use super::journal::JournalEntry;
use super::paths;
use super::vfs::{self, VfsMode};

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("local root {0} does not exist or is not a directory")]
    RootMissing(PathBuf),
    #[error("failed to read local root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of one local enumeration.
#[derive(Debug, Default, Clone)]
pub struct LocalSnapshot {
    pub items: BTreeMap<String, ItemRecord>,
    /// Paths that exist but could not be read.
    pub inaccessible: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct LocalWalker {
    pub root: PathBuf,
    pub exclusions: ExclusionList,
    pub algorithm: ChecksumAlgorithm,
    pub vfs: VfsMode,
}

impl LocalWalker {
    /// Blocking walk; run it on `spawn_blocking`.
    ///
    /// Checksums are reused from the journal when size, mtime and
    /// fingerprint all match the recorded state.
    pub fn walk(&self, journal: &BTreeMap<String, JournalEntry>) -> Result<LocalSnapshot, WalkError> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(WalkError::RootMissing(self.root.clone())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(WalkError::RootMissing(self.root.clone()));
            }
            Err(source) => {
                return Err(WalkError::Root {
                    path: self.root.clone(),
                    source,
                });
            }
        }

        let mut snapshot = LocalSnapshot::default();
        let mut placeholders = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match paths::rel_path_from_local(&self.root, entry.path()) {
                Ok(rel) => !self.exclusions.excluded(&rel, entry.file_type().is_dir()),
                Err(_) => false,
            });

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    if err.depth() == 0 {
                        return Err(WalkError::Root {
                            path: self.root.clone(),
                            source: err
                                .into_io_error()
                                .unwrap_or_else(|| io::Error::other("walk loop")),
                        });
                    }
                    if let Some(path) = err.path()
                        && let Ok(rel) = paths::rel_path_from_local(&self.root, path)
                    {
                        tracing::warn!(path = %rel, error = %err, "local path is not readable");
                        snapshot.inaccessible.insert(rel);
                    }
                    continue;
                }
            };
            let rel = match paths::rel_path_from_local(&self.root, entry.path()) {
                Ok(rel) => rel,
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "skipping local path");
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                tracing::debug!(path = %rel, "skipping symlink");
                continue;
            }
            if !file_type.is_dir() && !file_type.is_file() {
                continue;
            }
            if self.vfs == VfsMode::Suffix
                && file_type.is_file()
                && let Some(real) = vfs::strip_placeholder_suffix(paths::file_name(&rel))
            {
                let parent = paths::parent_path(&rel).unwrap_or("");
                placeholders.push(paths::join(parent, real));
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!(path = %rel, error = %err, "cannot stat local path");
                    snapshot.inaccessible.insert(rel);
                    continue;
                }
            };
            let mut record = record_from_metadata(&rel, &metadata);
            if record.item_type == ItemType::File {
                match self.checksum_for(entry.path(), &record, journal.get(&rel)) {
                    Ok(checksum) => record.checksum = Some(checksum),
                    Err(err) => {
                        tracing::warn!(path = %rel, error = %err, "cannot read local file");
                        snapshot.inaccessible.insert(rel);
                        continue;
                    }
                }
            }
            snapshot.items.insert(rel, record);
        }

        for path in placeholders {
            if snapshot.items.contains_key(&path) {
                continue;
            }
            match journal.get(&path) {
                Some(entry) if !entry.is_dir() => {
                    let mut record = entry.to_record();
                    record.placeholder = true;
                    snapshot.items.insert(path, record);
                }
                _ => tracing::debug!(path = %path, "ignoring placeholder without journal entry"),
            }
        }

        Ok(snapshot)
    }

    fn checksum_for(
        &self,
        path: &Path,
        record: &ItemRecord,
        known: Option<&JournalEntry>,
    ) -> io::Result<Checksum> {
        if let Some(entry) = known
            && entry.item_type == ItemType::File
            && entry.size == record.size
            && entry.modified == record.modified
            && entry.fingerprint == record.fingerprint
            && let Some(checksum) = &entry.checksum
            && checksum.algorithm == self.algorithm
        {
            return Ok(checksum.clone());
        }
        Checksum::of_file(self.algorithm, path)
    }
}

pub fn record_from_metadata(rel: &str, metadata: &Metadata) -> ItemRecord {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut record = if metadata.is_dir() {
        let mut dir = ItemRecord::dir(rel);
        dir.modified = modified;
        dir
    } else {
        ItemRecord::file(rel, metadata.len(), modified)
    };
    record.read_only = metadata.permissions().readonly();
    record.fingerprint = fingerprint(metadata);
    record
}

#[cfg(unix)]
fn fingerprint(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn fingerprint(_metadata: &Metadata) -> u64 {
    0
}

/// Current state of one local path, without checksum.
pub fn stat_path(local: &Path, rel: &str) -> io::Result<Option<ItemRecord>> {
    match std::fs::symlink_metadata(local) {
        Ok(metadata) => Ok(Some(record_from_metadata(rel, &metadata))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// True when `current` still looks like the item seen at discovery.
pub fn unchanged_since(expected: Option<&ItemRecord>, current: Option<&ItemRecord>) -> bool {
    match (expected, current) {
        (None, None) => true,
        (Some(expected), Some(current)) => {
            if expected.item_type != current.item_type {
                return false;
            }
            if expected.is_dir() {
                return true;
            }
            expected.size == current.size
                && expected.modified == current.modified
                && (expected.fingerprint == 0 || expected.fingerprint == current.fingerprint)
        }
        _ => false,
    }
}
