//! Selection expansion, execution-time re-evaluation and transfer statistics

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

use crate::manifest::{FileDescriptor, Manifest};
use crate::plan::{file_action, Action, Classification, Destination, LocalRoots, Overrides, DELETE_PREFIX};

/// Aggregate result of one `synchronize` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    pub selected_total: u64,
    pub to_transfer: u64,
    pub transferred_files: u64,
    pub bytes: u64,
    pub seconds: f64,
    pub new_count: u64,
    pub update_count: u64,
    pub same_count: u64,
    pub assets_files: u64,
    pub mods_files: u64,
}

impl TransferStats {
    pub fn add_file(&mut self, dest: Destination, bytes: u64) {
        self.transferred_files += 1;
        self.bytes += bytes;
        match dest {
            Destination::Assets => self.assets_files += 1,
            Destination::Mods => self.mods_files += 1,
        }
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Selected:              {}", self.selected_total)?;
        writeln!(f, "To transfer:           {}", self.to_transfer)?;
        writeln!(f, "  new:                 {}", self.new_count)?;
        writeln!(f, "  updated:             {}", self.update_count)?;
        writeln!(f, "Skipped (same):        {}", self.same_count)?;
        writeln!(f, "Transferred:           {}", self.transferred_files)?;
        writeln!(f, "  to Assets:           {}", self.assets_files)?;
        writeln!(f, "  to Mods:             {}", self.mods_files)?;
        writeln!(f, "Data:                  {:.1} KiB", self.bytes as f64 / 1024.0)?;
        write!(f, "Duration:              {:.1} s", self.seconds)
    }
}

/// A selected file with its resolved destination and local target
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub dest: Destination,
    pub descriptor: FileDescriptor,
    pub target: PathBuf,
}

/// A selected file after comparing it against local state
#[derive(Debug, Clone)]
pub struct EvaluatedFile {
    pub file: SelectedFile,
    pub action: Action,
}

/// Expand selected plan keys into concrete files.
///
/// Folder keys (`ID`) expand to every file of that folder, file keys
/// (`ID/path`) pass through. Deletion keys and keys unknown to the manifest
/// are ignored. Each identity key appears once, in first-selected order.
pub fn expand_selection<S: AsRef<str>>(
    keys: &[S],
    manifest: &Manifest,
    classification: &Classification,
    overrides: &Overrides,
    roots: &LocalRoots,
) -> Vec<SelectedFile> {
    let groups = manifest.grouped();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let mut push = |desc: &FileDescriptor, out: &mut Vec<SelectedFile>| {
        if !seen.insert(desc.key()) {
            return;
        }
        let dest = classification.target(&desc.folder_id, overrides);
        match roots.target(dest, desc) {
            Ok(target) => out.push(SelectedFile {
                dest,
                descriptor: desc.clone(),
                target,
            }),
            Err(e) => warn!("skipping {}: {}", desc.key(), e),
        }
    };

    for key in keys {
        let key = key.as_ref();
        if key.starts_with(DELETE_PREFIX) {
            continue;
        }
        if key.contains('/') {
            match manifest.get(key) {
                Some(desc) => push(desc, &mut out),
                None => warn!("selected key not in manifest: {}", key),
            }
        } else {
            match groups.get(key) {
                Some(files) => {
                    for desc in files {
                        push(*desc, &mut out);
                    }
                }
                None => warn!("selected folder not in manifest: {}", key),
            }
        }
    }
    out
}

/// Compare every selected file against its local target right now.
pub fn evaluate(files: Vec<SelectedFile>) -> Vec<EvaluatedFile> {
    files
        .into_iter()
        .map(|file| {
            let action = file_action(&file.target, &file.descriptor.sha256);
            EvaluatedFile { file, action }
        })
        .collect()
}

/// Statistics prefilled from the evaluation, before any transfer
pub fn initial_stats(evaluated: &[EvaluatedFile]) -> TransferStats {
    let mut stats = TransferStats {
        selected_total: evaluated.len() as u64,
        ..Default::default()
    };
    for e in evaluated {
        match e.action {
            Action::New => stats.new_count += 1,
            Action::Update => stats.update_count += 1,
            Action::Same => stats.same_count += 1,
            Action::Delete => {}
        }
    }
    stats.to_transfer = stats.new_count + stats.update_count;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha256_bytes;
    use crate::manifest::FileKind;
    use std::fs;
    use tempfile::TempDir;

    fn desc(folder: &str, name: &str, content: &[u8]) -> FileDescriptor {
        FileDescriptor {
            folder_id: folder.into(),
            relative_path: name.into(),
            size: content.len() as u64,
            mtime: 0.0,
            sha256: sha256_bytes(content),
            kind: FileKind::from_path(name),
        }
    }

    fn fixture() -> (Manifest, Classification) {
        let manifest: Manifest = vec![
            desc("1", "a.crp", b"a"),
            desc("1", "b.txt", b"b"),
            desc("2", "m.dll", b"m"),
        ]
        .into_iter()
        .collect();
        let classification = Classification::classify(&manifest);
        (manifest, classification)
    }

    #[test]
    fn test_expand_dedupes_folder_and_file_keys() {
        let tmp = TempDir::new().unwrap();
        let roots = LocalRoots::new(tmp.path().join("A"), tmp.path().join("M"));
        let (manifest, classification) = fixture();

        let keys = ["1", "1/a.crp", "2/m.dll", "(delete)/3", "9/unknown"];
        let files = expand_selection(&keys, &manifest, &classification, &Overrides::new(), &roots);
        let got: Vec<String> = files.iter().map(|f| f.descriptor.key()).collect();
        assert_eq!(got, vec!["1/a.crp", "1/b.txt", "2/m.dll"]);
        assert_eq!(files[2].dest, Destination::Mods);
        assert_eq!(files[2].target, roots.mods.join("2").join("m.dll"));
    }

    #[test]
    fn test_initial_stats_counts_actions() {
        let tmp = TempDir::new().unwrap();
        let roots = LocalRoots::new(tmp.path().join("A"), tmp.path().join("M"));
        let (manifest, classification) = fixture();
        fs::create_dir_all(roots.assets.join("1")).unwrap();
        fs::write(roots.assets.join("1/a.crp"), b"a").unwrap();
        fs::write(roots.assets.join("1/b.txt"), b"stale").unwrap();

        let files = expand_selection(&["1", "2"], &manifest, &classification, &Overrides::new(), &roots);
        let evaluated = evaluate(files);
        let stats = initial_stats(&evaluated);
        assert_eq!(stats.selected_total, 3);
        assert_eq!(stats.same_count, 1);
        assert_eq!(stats.update_count, 1);
        assert_eq!(stats.new_count, 1);
        assert_eq!(stats.to_transfer, 2);
        assert_eq!(stats.transferred_files, 0);
    }

    #[test]
    fn test_add_file_splits_by_destination() {
        let mut stats = TransferStats::default();
        stats.add_file(Destination::Assets, 10);
        stats.add_file(Destination::Mods, 5);
        stats.add_file(Destination::Mods, 1);
        assert_eq!(stats.transferred_files, 3);
        assert_eq!(stats.bytes, 16);
        assert_eq!(stats.assets_files, 1);
        assert_eq!(stats.mods_files, 2);
    }
}
