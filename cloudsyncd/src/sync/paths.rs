use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("path {path} is outside of {root}")]
    OutsideRoot { path: String, root: String },
    #[error("path is not valid UTF-8: {0}")]
    NotUtf8(String),
}

/// Maps a relative sync path ("Docs/A.txt") under the local root.
pub fn local_path_for(local_root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    let mut out = local_root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(rel.to_string()));
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`].
pub fn rel_path_from_local(local_root: &Path, local: &Path) -> Result<String, PathError> {
    let stripped = local
        .strip_prefix(local_root)
        .map_err(|_| PathError::OutsideRoot {
            path: local.display().to_string(),
            root: local_root.display().to_string(),
        })?;
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| PathError::NotUtf8(local.display().to_string()))?,
            ),
            Component::CurDir => continue,
            _ => return Err(PathError::UnsupportedComponent(local.display().to_string())),
        }
    }
    Ok(parts.join("/"))
}

/// Remote paths are POSIX-like and absolute ("/Sync/Docs/A.txt").
pub fn remote_path_for(remote_root: &str, rel: &str) -> String {
    let root = remote_root.trim_end_matches('/');
    if rel.is_empty() {
        if root.is_empty() {
            return "/".to_string();
        }
        return root.to_string();
    }
    format!("{root}/{rel}")
}

pub fn rel_path_from_remote(remote_root: &str, remote: &str) -> Result<String, PathError> {
    let root = remote_root.trim_end_matches('/');
    let rest = remote
        .strip_prefix(root)
        .ok_or_else(|| PathError::OutsideRoot {
            path: remote.to_string(),
            root: remote_root.to_string(),
        })?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return Err(PathError::OutsideRoot {
            path: remote.to_string(),
            root: remote_root.to_string(),
        });
    }
    let rel = rest.trim_matches('/');
    if rel.split('/').any(|part| part == ".." || part == ".") {
        return Err(PathError::UnsupportedComponent(remote.to_string()));
    }
    Ok(rel.to_string())
}

pub fn parent_path(rel: &str) -> Option<&str> {
    if rel.is_empty() {
        return None;
    }
    Some(rel.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(""))
}

pub fn file_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// True when `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return !path.is_empty();
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

pub fn is_same_or_descendant(path: &str, ancestor: &str) -> bool {
    path == ancestor || is_descendant(path, ancestor)
}

/// Re-keys `path` from below `from` to below `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    if !is_descendant(path, from) {
        return None;
    }
    let rest = &path[from.len()..];
    if to.is_empty() {
        Some(rest.trim_start_matches('/').to_string())
    } else {
        Some(format!("{to}{rest}"))
    }
}

/// Key used to detect case-only clashes.
pub fn case_key(rel: &str) -> String {
    rel.to_lowercase()
}
