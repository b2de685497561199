use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;
// Filesystem enumeration for numbered content folders

/// Folder IDs are non-empty runs of ASCII digits (leading zeros allowed)
pub fn is_folder_id(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

/// Regular file found beneath a folder root
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    /// posix-style path relative to the folder root
    pub rel_path: String,
    pub size: u64,
}

/// Immediate subdirectories of `root` whose names are folder IDs, sorted by
/// name. A missing root yields an empty list.
pub fn numeric_folders(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry in {}: {}", root.display(), e);
                continue;
            }
        };
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !is_folder_id(&name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            folders.push((name, entry.path()));
        }
    }
    folders.sort();
    Ok(folders)
}

/// posix-style relative path of `path` under `base`
pub fn rel_posix(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Every regular file beneath `folder`, recursively, in sorted path order.
/// Unreadable entries are logged and skipped.
pub fn enumerate_files(folder: &Path) -> Vec<FileEntry> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(folder)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable path under {}: {}", folder.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel_path) = rel_posix(folder, entry.path()) else {
            continue;
        };
        match entry.metadata() {
            Ok(metadata) => entries.push(FileEntry {
                path: entry.path().to_path_buf(),
                rel_path,
                size: metadata.len(),
            }),
            Err(e) => warn!("skipping {}: {}", entry.path().display(), e),
        }
    }

    entries
}
