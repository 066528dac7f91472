use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

use super::paths;

/// Prefix of in-flight download files next to their target.
pub const PARTIAL_PREFIX: &str = ".cloudsync-";
pub const PARTIAL_SUFFIX: &str = ".partial";

const BUILTIN_PATTERNS: &[&str] = &[
    ".cloudsync-*.partial",
    ".cloudsync-journal.db*",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "*~",
    ".~lock.*#",
];

const CONFLICT_COPY_PATTERN: &str = "* (conflicted copy *)*";

#[derive(Debug, Error)]
pub enum ExcludeError {
    #[error("invalid ignore pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("failed to read ignore file: {0}")]
    Io(#[from] std::io::Error),
}

/// Ignore patterns and selective-sync exclusions shared by both walkers.
///
/// Patterns without a `/` match the item name at any depth, patterns with a
/// `/` match the whole relative path. A trailing `/` restricts a pattern to
/// directories.
#[derive(Debug, Clone)]
pub struct ExclusionList {
    names: GlobSet,
    full_paths: GlobSet,
    dir_names: GlobSet,
    dir_paths: GlobSet,
    selective: Vec<String>,
}

impl Default for ExclusionList {
    fn default() -> Self {
        Self::builder()
            .build()
            .unwrap_or_else(|_| Self::empty())
    }
}

impl ExclusionList {
    pub fn builder() -> ExclusionListBuilder {
        ExclusionListBuilder {
            patterns: BUILTIN_PATTERNS.iter().map(|p| p.to_string()).collect(),
            selective: Vec::new(),
        }
    }

    fn empty() -> Self {
        Self {
            names: GlobSet::empty(),
            full_paths: GlobSet::empty(),
            dir_names: GlobSet::empty(),
            dir_paths: GlobSet::empty(),
            selective: Vec::new(),
        }
    }

    pub fn excluded(&self, path: &str, is_dir: bool) -> bool {
        if path.is_empty() {
            return false;
        }
        if self.is_selectively_excluded(path) {
            return true;
        }
        let name = paths::file_name(path);
        if self.names.is_match(name) || self.full_paths.is_match(path) {
            return true;
        }
        is_dir && (self.dir_names.is_match(name) || self.dir_paths.is_match(path))
    }

    pub fn is_selectively_excluded(&self, path: &str) -> bool {
        self.selective
            .iter()
            .any(|root| paths::is_same_or_descendant(path, root))
    }
}

pub struct ExclusionListBuilder {
    patterns: Vec<String>,
    selective: Vec<String>,
}

impl ExclusionListBuilder {
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Reads one pattern per line; blank lines and `#` comments are skipped.
    pub fn ignore_file(self, path: &Path) -> Result<Self, ExcludeError> {
        let text = std::fs::read_to_string(path)?;
        let patterns: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Ok(self.patterns(patterns))
    }

    /// Keeps conflict copies local instead of uploading them.
    pub fn local_conflict_copies(self) -> Self {
        self.pattern(CONFLICT_COPY_PATTERN)
    }

    pub fn selective_sync<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selective.extend(
            roots
                .into_iter()
                .map(|root| root.into().trim_matches('/').to_string()),
        );
        self
    }

    pub fn build(self) -> Result<ExclusionList, ExcludeError> {
        let mut names = GlobSetBuilder::new();
        let mut full_paths = GlobSetBuilder::new();
        let mut dir_names = GlobSetBuilder::new();
        let mut dir_paths = GlobSetBuilder::new();
        for raw in &self.patterns {
            let (pattern, dir_only) = match raw.strip_suffix('/') {
                Some(stripped) => (stripped.trim_start_matches('/'), true),
                None => (raw.trim_start_matches('/'), false),
            };
            if pattern.is_empty() {
                continue;
            }
            let glob = Glob::new(pattern).map_err(|source| ExcludeError::Pattern {
                pattern: raw.clone(),
                source,
            })?;
            match (pattern.contains('/'), dir_only) {
                (false, false) => names.add(glob),
                (true, false) => full_paths.add(glob),
                (false, true) => dir_names.add(glob),
                (true, true) => dir_paths.add(glob),
            };
        }
        let build = |builder: GlobSetBuilder| {
            builder.build().map_err(|source| ExcludeError::Pattern {
                pattern: "<set>".to_string(),
                source,
            })
        };
        Ok(ExclusionList {
            names: build(names)?,
            full_paths: build(full_paths)?,
            dir_names: build(dir_names)?,
            dir_paths: build(dir_paths)?,
            selective: self.selective,
        })
    }
}

pub fn partial_name(name: &str) -> String {
    format!("{PARTIAL_PREFIX}{name}{PARTIAL_SUFFIX}")
}

pub fn is_partial_name(name: &str) -> bool {
    name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX)
}
