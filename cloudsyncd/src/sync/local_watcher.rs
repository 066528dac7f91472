use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::exclude::ExclusionList;
use super::paths;

/// A filesystem notification below the sync root, as a relative path.
/// Only used to decide when to start a run; discovery does the diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed { path: String },
    Removed { path: String },
    Moved { from: String, to: String },
}

impl LocalEvent {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            LocalEvent::Changed { path } | LocalEvent::Removed { path } => vec![path],
            LocalEvent::Moved { from, to } => vec![from, to],
        }
    }
}

pub fn start_notify_watcher(
    root: &Path,
    exclusions: ExclusionList,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for local in map_event(&watch_root, &exclusions, event) {
                let _ = tx.send(local);
            }
        }
        Err(err) => tracing::warn!(error = %err, "watcher error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, exclusions: &ExclusionList, event: Event) -> Vec<LocalEvent> {
    let rel = |path: &PathBuf| relative(root, exclusions, path);
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if event.paths.len() >= 2 => {
            match (rel(&event.paths[0]), rel(&event.paths[1])) {
                (Some(from), Some(to)) => vec![LocalEvent::Moved { from, to }],
                (Some(path), None) => vec![LocalEvent::Removed { path }],
                (None, Some(path)) => vec![LocalEvent::Changed { path }],
                (None, None) => Vec::new(),
            }
        }
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(rel)
            .map(|path| LocalEvent::Changed { path })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(rel)
            .map(|path| LocalEvent::Removed { path })
            .collect(),
        _ => Vec::new(),
    }
}

fn relative(root: &Path, exclusions: &ExclusionList, path: &Path) -> Option<String> {
    let rel = paths::rel_path_from_local(root, path).ok()?;
    if rel.is_empty() {
        return None;
    }
    let mut ancestor = Some(rel.as_str());
    while let Some(current) = ancestor.filter(|p| !p.is_empty()) {
        let is_dir = current != rel || path.is_dir();
        if exclusions.excluded(current, is_dir) {
            return None;
        }
        ancestor = paths::parent_path(current);
    }
    Some(rel)
}
