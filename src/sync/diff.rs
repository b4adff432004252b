//! Manifest diffing.
//!
//! Remote-wins policy: the peer's manifest is authoritative. The diff is
//! purely functional and deterministic in its two inputs.

use std::collections::HashMap;

use crate::wire::FileEntry;

/// The work a sync has to do, computed once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Remote entries to fetch, in remote manifest order.
    pub to_download: Vec<FileEntry>,
    /// Local relative paths absent from the remote manifest.
    pub to_delete: Vec<String>,
}

impl SyncPlan {
    /// True when the local tree already matches the remote one.
    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty() && self.to_delete.is_empty()
    }
}

/// Compare two manifests. Equality per path is by `(size, last_write_ticks)`.
pub fn diff(local: &[FileEntry], remote: &[FileEntry]) -> SyncPlan {
    let local_by_path: HashMap<&str, &FileEntry> = local
        .iter()
        .map(|entry| (entry.relative_path.as_str(), entry))
        .collect();

    let to_download = remote
        .iter()
        .filter(|remote_entry| {
            match local_by_path.get(remote_entry.relative_path.as_str()) {
                None => true,
                Some(local_entry) => {
                    local_entry.size != remote_entry.size
                        || local_entry.last_write_ticks != remote_entry.last_write_ticks
                }
            }
        })
        .cloned()
        .collect();

    let remote_paths: HashMap<&str, ()> = remote
        .iter()
        .map(|entry| (entry.relative_path.as_str(), ()))
        .collect();
    let to_delete = local
        .iter()
        .filter(|entry| !remote_paths.contains_key(entry.relative_path.as_str()))
        .map(|entry| entry.relative_path.clone())
        .collect();

    SyncPlan {
        to_download,
        to_delete,
    }
}
