//! Best-effort removal of local folders and files
//!
//! Every filesystem failure is logged and skipped; the returned counts only
//! reflect what was actually removed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::fs_enum::is_folder_id;
use crate::plan::{LocalRoots, DELETE_PREFIX};
use crate::protocol_core::join_under_root;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteStats {
    pub files_deleted: u64,
    pub folders_deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeleteTarget {
    Folder(String),
    File { folder_id: String, rel_path: String },
}

/// Parse `(delete)/ID`, `(delete)/ID/path`, `ID` or `ID/path`.
/// Returns `None` for non-numeric folder IDs or an empty path.
pub fn parse_delete_key(key: &str) -> Option<DeleteTarget> {
    let tail = key.strip_prefix(DELETE_PREFIX).unwrap_or(key);
    match tail.split_once('/') {
        Some((folder_id, rel_path)) => {
            if is_folder_id(folder_id) && !rel_path.is_empty() {
                Some(DeleteTarget::File {
                    folder_id: folder_id.to_string(),
                    rel_path: rel_path.to_string(),
                })
            } else {
                None
            }
        }
        None if is_folder_id(tail) => Some(DeleteTarget::Folder(tail.to_string())),
        None => None,
    }
}

/// Delete whole folders (under both roots) and single files (first root
/// that has them, assets before mods). Folder deletes run first.
pub fn delete_local<S: AsRef<str>>(roots: &LocalRoots, keys: &[S]) -> DeleteStats {
    let mut folders = BTreeSet::new();
    let mut files = Vec::new();
    for key in keys {
        match parse_delete_key(key.as_ref()) {
            Some(DeleteTarget::Folder(id)) => {
                folders.insert(id);
            }
            Some(DeleteTarget::File { folder_id, rel_path }) => files.push((folder_id, rel_path)),
            None => debug!("ignoring delete key {:?}", key.as_ref()),
        }
    }

    let mut stats = DeleteStats::default();

    for folder_id in &folders {
        for (_, base) in roots.all() {
            let dir = base.join(folder_id);
            if dir.is_dir() {
                delete_folder(&dir, &mut stats);
            }
        }
    }

    for (folder_id, rel_path) in &files {
        if !delete_file(roots, folder_id, rel_path, &mut stats) {
            warn!("file not found for deletion: {}/{} (Assets/Mods)", folder_id, rel_path);
        }
    }

    info!(
        "deleted {} files, {} folders",
        stats.files_deleted, stats.folders_deleted
    );
    stats
}

fn delete_folder(dir: &std::path::Path, stats: &mut DeleteStats) {
    // contents_first yields children before their parent directory
    for entry in WalkDir::new(dir).follow_links(false).contents_first(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("cannot walk {}: {}", dir.display(), e);
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_file() {
            match fs::remove_file(path) {
                Ok(()) => {
                    stats.files_deleted += 1;
                    info!("deleted {}", path.display());
                }
                Err(e) => warn!("could not delete {}: {}", path.display(), e),
            }
        } else if entry.file_type().is_dir() && path != dir {
            // Emptied subdirectory; left alone if anything remains in it
            if let Err(e) = fs::remove_dir(path) {
                debug!("keeping {}: {}", path.display(), e);
            }
        }
    }

    match fs::remove_dir(dir) {
        Ok(()) => {
            stats.folders_deleted += 1;
            info!("deleted folder {}", dir.display());
        }
        Err(e) => debug!("keeping folder {}: {}", dir.display(), e),
    }
}

/// Returns true once a file was removed
fn delete_file(roots: &LocalRoots, folder_id: &str, rel_path: &str, stats: &mut DeleteStats) -> bool {
    for (_, base) in roots.all() {
        let path = match join_under_root(&base.join(folder_id), rel_path) {
            Ok(p) => p,
            Err(e) => {
                warn!("refusing to delete {}/{}: {}", folder_id, rel_path, e);
                return false;
            }
        };
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                stats.files_deleted += 1;
                info!("deleted {}", path.display());
                return true;
            }
            Err(e) => warn!("could not delete {}: {}", path.display(), e),
        }
    }
    false
}
