//! Manifest: the host's point-in-time enumeration of every file beneath its
//! numbered content folders, keyed by `folder_id/relative_path`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use crate::checksum::sha256_file;
use crate::fs_enum::{enumerate_files, numeric_folders, FileEntry};

/// File category, derived from the extension alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Crp,
    Dll,
    #[default]
    Other,
}

impl FileKind {
    pub fn from_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && ext.eq_ignore_ascii_case("crp") => {
                FileKind::Crp
            }
            Some((stem, ext)) if !stem.is_empty() && ext.eq_ignore_ascii_case("dll") => {
                FileKind::Dll
            }
            _ => FileKind::Other,
        }
    }
}

/// One file known to the system. Field names follow the wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(rename = "rel_folder")]
    pub folder_id: String,
    #[serde(rename = "name")]
    pub relative_path: String,
    pub size: u64,
    pub mtime: f64,
    pub sha256: String,
    pub kind: FileKind,
}

impl FileDescriptor {
    /// Identity key: `folder_id/relative_path`
    pub fn key(&self) -> String {
        identity_key(&self.folder_id, &self.relative_path)
    }

    /// Synthetic zero-size descriptor standing in for a whole folder
    pub fn folder_placeholder(folder_id: &str) -> Self {
        Self {
            folder_id: folder_id.to_string(),
            relative_path: "(folder)".to_string(),
            size: 0,
            mtime: 0.0,
            sha256: String::new(),
            kind: FileKind::Other,
        }
    }
}

pub fn identity_key(folder_id: &str, relative_path: &str) -> String {
    format!("{}/{}", folder_id, relative_path)
}

/// Identity key -> descriptor. Iterates in key order, so every pass over the
/// same manifest sees the same sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, FileDescriptor>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, desc: FileDescriptor) {
        self.entries.insert(desc.key(), desc);
    }

    pub fn get(&self, key: &str) -> Option<&FileDescriptor> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, FileDescriptor> {
        self.entries.iter()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.entries.values()
    }

    /// Descriptors grouped by folder ID, in manifest order within each folder
    pub fn grouped(&self) -> BTreeMap<&str, Vec<&FileDescriptor>> {
        let mut groups: BTreeMap<&str, Vec<&FileDescriptor>> = BTreeMap::new();
        for desc in self.entries.values() {
            groups.entry(desc.folder_id.as_str()).or_default().push(desc);
        }
        groups
    }

    pub fn has_folder(&self, folder_id: &str) -> bool {
        self.entries.values().any(|d| d.folder_id == folder_id)
    }
}

impl FromIterator<FileDescriptor> for Manifest {
    fn from_iter<I: IntoIterator<Item = FileDescriptor>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for desc in iter {
            manifest.insert(desc);
        }
        manifest
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = (&'a String, &'a FileDescriptor);
    type IntoIter = btree_map::Iter<'a, String, FileDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn describe(folder_id: &str, entry: &FileEntry) -> Option<FileDescriptor> {
    let result = (|| -> std::io::Result<FileDescriptor> {
        let metadata = std::fs::metadata(&entry.path)?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Ok(FileDescriptor {
            folder_id: folder_id.to_string(),
            relative_path: entry.rel_path.clone(),
            size: metadata.len(),
            mtime,
            sha256: sha256_file(&entry.path)?,
            kind: FileKind::from_path(&entry.rel_path),
        })
    })();

    match result {
        Ok(desc) => {
            debug!("found {} ({:?})", desc.key(), desc.kind);
            Some(desc)
        }
        Err(e) => {
            warn!("skipping {}: {}", entry.path.display(), e);
            None
        }
    }
}

/// Scan every numbered folder under `content_root` and hash each regular
/// file. A missing root yields an empty manifest; unreadable files are
/// logged and left out.
pub fn build_manifest(content_root: &Path) -> Manifest {
    if !content_root.exists() {
        warn!("content root does not exist: {}", content_root.display());
        return Manifest::new();
    }

    let folders = match numeric_folders(content_root) {
        Ok(f) => f,
        Err(e) => {
            warn!("cannot list content root {}: {}", content_root.display(), e);
            return Manifest::new();
        }
    };

    let jobs: Vec<(String, FileEntry)> = folders
        .iter()
        .flat_map(|(id, path)| {
            enumerate_files(path)
                .into_iter()
                .map(move |entry| (id.clone(), entry))
        })
        .collect();

    let manifest: Manifest = jobs
        .par_iter()
        .filter_map(|(id, entry)| describe(id, entry))
        .collect::<Vec<_>>()
        .into_iter()
        .collect();

    info!(
        "scan complete: {} entries in {} folders",
        manifest.len(),
        folders.len()
    );
    manifest
}
