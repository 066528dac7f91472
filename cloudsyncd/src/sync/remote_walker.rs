use std::collections::{BTreeMap, HashSet};

use cloudsync_core::RemoteError;

use super::exclude::ExclusionList;
use super::item::ItemRecord;
use super::paths;
use super::remote::RemoteStore;

/// Enumerates the remote tree through one recursive listing.
///
/// Excluded items drop their whole subtree. A resource id seen twice keeps
/// its first path; later duplicates are dropped.
pub async fn walk_remote(
    remote: &dyn RemoteStore,
    exclusions: &ExclusionList,
) -> Result<BTreeMap<String, ItemRecord>, RemoteError> {
    let mut listing = remote.list_tree().await?;
    listing.sort_by(|a, b| a.path.cmp(&b.path));

    let mut items = BTreeMap::new();
    let mut excluded_dirs: Vec<String> = Vec::new();
    let mut seen_ids = HashSet::new();
    for record in listing {
        if record.path.is_empty() {
            continue;
        }
        if excluded_dirs
            .iter()
            .any(|dir| paths::is_descendant(&record.path, dir))
        {
            continue;
        }
        if exclusions.excluded(&record.path, record.is_dir()) {
            if record.is_dir() {
                excluded_dirs.push(record.path.clone());
            }
            continue;
        }
        if let Some(id) = &record.resource_id
            && !seen_ids.insert(id.clone())
        {
            tracing::warn!(path = %record.path, resource_id = %id, "duplicate remote resource id, ignoring item");
            continue;
        }
        if items.contains_key(&record.path) {
            tracing::warn!(path = %record.path, "duplicate remote path, ignoring item");
            continue;
        }
        items.insert(record.path.clone(), record);
    }
    tracing::debug!(items = items.len(), "remote walk finished");
    Ok(items)
}
