//! Client-side reconciliation of a remote manifest against the two local
//! destination roots.
//!
//! Each folder ID is classified from the kinds of files it holds, resolved
//! to a destination (ASSETS or MODS, honoring explicit overrides), and every
//! file is compared by content hash against `<base>/<folder_id>/<path>`.
//! Numbered folders that exist locally but not in the manifest become
//! DELETE candidates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::checksum::sha256_file;
use crate::fs_enum::{enumerate_files, numeric_folders};
use crate::manifest::{FileDescriptor, FileKind, Manifest};
use crate::protocol_core::join_under_root;

/// Key prefix for deletion candidates
pub const DELETE_PREFIX: &str = "(delete)/";

/// Where a folder's files are installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Assets,
    Mods,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Assets => write!(f, "Assets"),
            Destination::Mods => write!(f, "Mods"),
        }
    }
}

/// Derived category of a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderClass {
    Assets,
    Mods,
    Mixed,
}

impl FolderClass {
    /// ASSETS for crp-only or neither, MODS for dll-only, MIXED for both
    pub fn from_kinds<'a, I>(kinds: I) -> Self
    where
        I: IntoIterator<Item = &'a FileKind>,
    {
        let mut has_crp = false;
        let mut has_dll = false;
        for kind in kinds {
            match kind {
                FileKind::Crp => has_crp = true,
                FileKind::Dll => has_dll = true,
                FileKind::Other => {}
            }
        }
        match (has_crp, has_dll) {
            (true, true) => FolderClass::Mixed,
            (false, true) => FolderClass::Mods,
            _ => FolderClass::Assets,
        }
    }
}

/// Externally chosen destinations, keyed by folder ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides(BTreeMap<String, Destination>);

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, folder_id: impl Into<String>, dest: Destination) {
        self.0.insert(folder_id.into(), dest);
    }

    pub fn get(&self, folder_id: &str) -> Option<Destination> {
        self.0.get(folder_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Merge `other` into `self`, `other` wins on conflicts
    pub fn extend(&mut self, other: Overrides) {
        self.0.extend(other.0);
    }
}

/// Decides a destination for folders whose content is MIXED
pub trait DestinationResolver {
    fn resolve(&self, folder_id: &str) -> Destination;
}

impl<F> DestinationResolver for F
where
    F: Fn(&str) -> Destination,
{
    fn resolve(&self, folder_id: &str) -> Destination {
        self(folder_id)
    }
}

/// Folder ID -> derived class, rebuilt in full for every manifest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification(BTreeMap<String, FolderClass>);

impl Classification {
    pub fn classify(manifest: &Manifest) -> Self {
        let mut classes = BTreeMap::new();
        for (folder_id, files) in manifest.grouped() {
            let class = FolderClass::from_kinds(files.iter().map(|f| &f.kind));
            if class == FolderClass::Assets
                && !files.iter().any(|f| f.kind == FileKind::Crp)
            {
                info!("folder {} holds no .crp/.dll files, defaulting to Assets", folder_id);
            }
            classes.insert(folder_id.to_string(), class);
        }
        Classification(classes)
    }

    pub fn get(&self, folder_id: &str) -> Option<FolderClass> {
        self.0.get(folder_id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FolderClass)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Override first, then the derived class; MIXED and unknown fall back to ASSETS.
    pub fn target(&self, folder_id: &str, overrides: &Overrides) -> Destination {
        if let Some(dest) = overrides.get(folder_id) {
            return dest;
        }
        match self.get(folder_id) {
            Some(FolderClass::Mods) => Destination::Mods,
            _ => Destination::Assets,
        }
    }

    /// MIXED folders that no override has settled yet
    pub fn mixed_folders(&self, overrides: &Overrides) -> BTreeSet<String> {
        self.0
            .iter()
            .filter(|(id, class)| **class == FolderClass::Mixed && overrides.get(id).is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ask `resolver` for every unsettled MIXED folder
    pub fn resolve_mixed<R>(&self, overrides: &Overrides, resolver: &R) -> Overrides
    where
        R: DestinationResolver + ?Sized,
    {
        let mut decided = Overrides::new();
        for folder_id in self.mixed_folders(overrides) {
            let dest = resolver.resolve(&folder_id);
            info!("destination for mixed folder {}: {}", folder_id, dest);
            decided.set(folder_id, dest);
        }
        decided
    }
}

/// The two local destination roots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRoots {
    pub assets: PathBuf,
    pub mods: PathBuf,
}

impl LocalRoots {
    pub fn new(assets: impl Into<PathBuf>, mods: impl Into<PathBuf>) -> Self {
        Self {
            assets: assets.into(),
            mods: mods.into(),
        }
    }

    pub fn base(&self, dest: Destination) -> &Path {
        match dest {
            Destination::Assets => &self.assets,
            Destination::Mods => &self.mods,
        }
    }

    /// Roots in lookup order: assets before mods
    pub fn all(&self) -> [(Destination, &Path); 2] {
        [
            (Destination::Assets, self.assets.as_path()),
            (Destination::Mods, self.mods.as_path()),
        ]
    }

    /// `<base>/<folder_id>/<relative_path>`
    pub fn target(&self, dest: Destination, desc: &FileDescriptor) -> crate::error::Result<PathBuf> {
        let folder = join_under_root(self.base(dest), &desc.folder_id)?;
        join_under_root(&folder, &desc.relative_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Same,
    New,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::New => "NEW",
            Action::Update => "UPDATE",
            Action::Same => "SAME",
            Action::Delete => "DELETE",
        };
        f.pad(s)
    }
}

impl Action {
    /// Worst case of the children: UPDATE beats NEW beats SAME
    pub fn aggregate<I>(actions: I) -> Action
    where
        I: IntoIterator<Item = Action>,
    {
        let mut folder = Action::Same;
        for action in actions {
            match action {
                Action::Update => return Action::Update,
                Action::New => folder = Action::New,
                Action::Same | Action::Delete => {}
            }
        }
        folder
    }

    pub fn needs_transfer(self) -> bool {
        matches!(self, Action::New | Action::Update)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Folder,
    File,
}

/// One row of the reconciliation output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub key: String,
    pub descriptor: FileDescriptor,
    pub target: PathBuf,
    pub action: Action,
    pub level: Level,
}

/// NEW if `target` is absent, SAME if its hash matches, UPDATE otherwise.
/// A target that exists but cannot be hashed counts as UPDATE.
pub fn file_action(target: &Path, expected_sha256: &str) -> Action {
    if !target.is_file() {
        return Action::New;
    }
    match sha256_file(target) {
        Ok(hash) if hash == expected_sha256 => Action::Same,
        Ok(_) => Action::Update,
        Err(e) => {
            warn!("cannot hash {}: {}", target.display(), e);
            Action::Update
        }
    }
}

/// Build the full plan: one folder row followed by its file rows for every
/// manifest folder, then DELETE rows for numbered local folders the manifest
/// no longer has.
pub fn build_plan(
    manifest: &Manifest,
    classification: &Classification,
    overrides: &Overrides,
    roots: &LocalRoots,
) -> Vec<PlanItem> {
    let mut plan = Vec::new();
    let groups = manifest.grouped();

    for (folder_id, files) in &groups {
        let dest = classification.target(folder_id, overrides);

        let mut rows = Vec::with_capacity(files.len());
        for desc in files {
            let target = match roots.target(dest, desc) {
                Ok(t) => t,
                Err(e) => {
                    warn!("skipping {}: {}", desc.key(), e);
                    continue;
                }
            };
            let action = file_action(&target, &desc.sha256);
            rows.push(PlanItem {
                key: desc.key(),
                descriptor: (*desc).clone(),
                target,
                action,
                level: Level::File,
            });
        }
        if rows.is_empty() {
            continue;
        }

        plan.push(PlanItem {
            key: folder_id.to_string(),
            descriptor: FileDescriptor::folder_placeholder(folder_id),
            target: roots.base(dest).join(folder_id),
            action: Action::aggregate(rows.iter().map(|r| r.action)),
            level: Level::Folder,
        });
        plan.extend(rows);
    }

    plan.extend(delete_candidates(manifest, roots));

    info!(
        "plan built: {} items ({} folders)",
        plan.len(),
        groups.len()
    );
    plan
}

/// DELETE rows for numbered folders present under either root but absent
/// from the manifest. File hashes are left empty.
pub fn delete_candidates(manifest: &Manifest, roots: &LocalRoots) -> Vec<PlanItem> {
    let remote: BTreeSet<&str> = manifest.descriptors().map(|d| d.folder_id.as_str()).collect();

    let mut local: BTreeSet<String> = BTreeSet::new();
    for (_, base) in roots.all() {
        match numeric_folders(base) {
            Ok(folders) => local.extend(folders.into_iter().map(|(id, _)| id)),
            Err(e) => warn!("cannot list {}: {}", base.display(), e),
        }
    }

    let mut rows = Vec::new();
    for folder_id in local.iter().filter(|id| !remote.contains(id.as_str())) {
        rows.push(PlanItem {
            key: format!("{}{}", DELETE_PREFIX, folder_id),
            descriptor: FileDescriptor::folder_placeholder(folder_id),
            target: roots.assets.join(folder_id),
            action: Action::Delete,
            level: Level::Folder,
        });

        for (_, base) in roots.all() {
            let dir = base.join(folder_id);
            if !dir.is_dir() {
                continue;
            }
            for entry in enumerate_files(&dir) {
                let mtime = std::fs::metadata(&entry.path)
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default();
                rows.push(PlanItem {
                    key: format!("{}{}/{}", DELETE_PREFIX, folder_id, entry.rel_path),
                    descriptor: FileDescriptor {
                        folder_id: folder_id.clone(),
                        relative_path: entry.rel_path.clone(),
                        size: entry.size,
                        mtime,
                        sha256: String::new(),
                        kind: FileKind::from_path(&entry.rel_path),
                    },
                    target: entry.path,
                    action: Action::Delete,
                    level: Level::File,
                });
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha256_bytes;
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

    fn roots(tmp: &TempDir) -> LocalRoots {
        LocalRoots::new(tmp.path().join("Assets"), tmp.path().join("Mods"))
    }

    fn plan_for(manifest: &Manifest, overrides: &Overrides, roots: &LocalRoots) -> Vec<PlanItem> {
        let classification = Classification::classify(manifest);
        build_plan(manifest, &classification, overrides, roots)
    }

    #[test]
    fn test_classification_rules() {
        let manifest: Manifest = vec![
            desc("1", "a.crp", b"a"),
            desc("1", "readme.txt", b"r"),
            desc("2", "m.dll", b"m"),
            desc("3", "a.crp", b"a"),
            desc("3", "m.DLL", b"m"),
            desc("4", "notes.txt", b"n"),
        ]
        .into_iter()
        .collect();
        let c = Classification::classify(&manifest);
        assert_eq!(c.get("1"), Some(FolderClass::Assets));
        assert_eq!(c.get("2"), Some(FolderClass::Mods));
        assert_eq!(c.get("3"), Some(FolderClass::Mixed));
        assert_eq!(c.get("4"), Some(FolderClass::Assets));
        assert_eq!(c.get("5"), None);
    }

    #[test]
    fn test_target_resolution_and_overrides() {
        let manifest: Manifest = vec![
            desc("2", "m.dll", b"m"),
            desc("3", "a.crp", b"a"),
            desc("3", "m.dll", b"m"),
        ]
        .into_iter()
        .collect();
        let c = Classification::classify(&manifest);
        let mut overrides = Overrides::new();

        assert_eq!(c.target("2", &overrides), Destination::Mods);
        assert_eq!(c.target("3", &overrides), Destination::Assets);
        assert_eq!(c.target("unknown", &overrides), Destination::Assets);
        assert_eq!(c.mixed_folders(&overrides), BTreeSet::from(["3".to_string()]));

        overrides.set("3", Destination::Mods);
        overrides.set("2", Destination::Assets);
        assert_eq!(c.target("3", &overrides), Destination::Mods);
        assert_eq!(c.target("2", &overrides), Destination::Assets);
        assert!(c.mixed_folders(&overrides).is_empty());
    }

    #[test]
    fn test_resolve_mixed_with_closure() {
        let manifest: Manifest = vec![
            desc("3", "a.crp", b"a"),
            desc("3", "m.dll", b"m"),
            desc("8", "b.crp", b"b"),
            desc("8", "n.dll", b"n"),
        ]
        .into_iter()
        .collect();
        let c = Classification::classify(&manifest);
        let mut existing = Overrides::new();
        existing.set("8", Destination::Assets);

        let decided = c.resolve_mixed(&existing, &|_: &str| Destination::Mods);
        assert_eq!(decided.len(), 1);
        assert_eq!(decided.get("3"), Some(Destination::Mods));
    }

    #[test]
    fn test_aggregate() {
        use Action::*;
        assert_eq!(Action::aggregate([Same, Same]), Same);
        assert_eq!(Action::aggregate([Same, New]), New);
        assert_eq!(Action::aggregate([New, Update, Same]), Update);
        assert_eq!(Action::aggregate([Update]), Update);
    }

    #[test]
    fn test_new_file_into_empty_assets() {
        let tmp = TempDir::new().unwrap();
        let roots = roots(&tmp);
        let manifest: Manifest = vec![desc("42", "readme.txt", b"hello")].into_iter().collect();

        let plan = plan_for(&manifest, &Overrides::new(), &roots);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].key, "42");
        assert_eq!(plan[0].level, Level::Folder);
        assert_eq!(plan[0].action, Action::New);
        assert_eq!(plan[0].descriptor.size, 0);
        assert_eq!(plan[1].key, "42/readme.txt");
        assert_eq!(plan[1].level, Level::File);
        assert_eq!(plan[1].action, Action::New);
        assert_eq!(plan[1].target, roots.assets.join("42").join("readme.txt"));
    }

    #[test]
    fn test_same_update_new_by_hash() {
        let tmp = TempDir::new().unwrap();
        let roots = roots(&tmp);
        fs::create_dir_all(roots.assets.join("42")).unwrap();
        fs::write(roots.assets.join("42/same.txt"), b"same").unwrap();
        // same size, different content: hash decides
        fs::write(roots.assets.join("42/changed.txt"), b"old!").unwrap();

        let manifest: Manifest = vec![
            desc("42", "same.txt", b"same"),
            desc("42", "changed.txt", b"new!"),
            desc("42", "missing.txt", b"m"),
        ]
        .into_iter()
        .collect();
        let plan = plan_for(&manifest, &Overrides::new(), &roots);

        let action = |key: &str| plan.iter().find(|p| p.key == key).unwrap().action;
        assert_eq!(action("42/same.txt"), Action::Same);
        assert_eq!(action("42/changed.txt"), Action::Update);
        assert_eq!(action("42/missing.txt"), Action::New);
        assert_eq!(action("42"), Action::Update);
    }

    #[test]
    fn test_sole_identical_file_is_same_for_folder() {
        let tmp = TempDir::new().unwrap();
        let roots = roots(&tmp);
        fs::create_dir_all(roots.assets.join("42")).unwrap();
        fs::write(roots.assets.join("42/readme.txt"), b"hello").unwrap();
        let manifest: Manifest = vec![desc("42", "readme.txt", b"hello")].into_iter().collect();

        let plan = plan_for(&manifest, &Overrides::new(), &roots);
        assert_eq!(plan[0].action, Action::Same);
        assert_eq!(plan[1].action, Action::Same);
    }

    #[test]
    fn test_mods_folder_targets_mods_root() {
        let tmp = TempDir::new().unwrap();
        let roots = roots(&tmp);
        // Present under Assets, but the folder belongs in Mods: still NEW
        fs::create_dir_all(roots.assets.join("9")).unwrap();
        fs::write(roots.assets.join("9/m.dll"), b"mod").unwrap();
        let manifest: Manifest = vec![desc("9", "m.dll", b"mod")].into_iter().collect();

        let plan = plan_for(&manifest, &Overrides::new(), &roots);
        assert_eq!(plan[1].target, roots.mods.join("9").join("m.dll"));
        assert_eq!(plan[1].action, Action::New);

        let mut overrides = Overrides::new();
        overrides.set("9", Destination::Assets);
        let plan = plan_for(&manifest, &overrides, &roots);
        assert_eq!(plan[1].action, Action::Same);
    }

    #[test]
    fn test_delete_candidates() {
        let tmp = TempDir::new().unwrap();
        let roots = roots(&tmp);
        fs::create_dir_all(roots.assets.join("42")).unwrap();
        fs::create_dir_all(roots.assets.join("99/sub")).unwrap();
        fs::write(roots.assets.join("99/a.crp"), b"a").unwrap();
        fs::write(roots.assets.join("99/sub/b.txt"), b"b").unwrap();
        fs::create_dir_all(roots.mods.join("99")).unwrap();
        fs::write(roots.mods.join("99/c.dll"), b"c").unwrap();
        fs::create_dir_all(roots.mods.join("Harmony")).unwrap();

        let manifest: Manifest = vec![desc("42", "readme.txt", b"hello")].into_iter().collect();
        let plan = plan_for(&manifest, &Overrides::new(), &roots);

        let deletes: Vec<&PlanItem> = plan.iter().filter(|p| p.action == Action::Delete).collect();
        let keys: Vec<&str> = deletes.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["(delete)/99", "(delete)/99/a.crp", "(delete)/99/sub/b.txt", "(delete)/99/c.dll"]
        );
        assert_eq!(deletes[0].level, Level::Folder);
        assert!(deletes[1..].iter().all(|p| p.level == Level::File && p.descriptor.sha256.is_empty()));
        assert_eq!(deletes[3].descriptor.kind, FileKind::Dll);

        // Folder 42 is in the manifest, never a delete candidate
        assert!(!plan.iter().any(|p| p.key == "(delete)/42"));
    }

    #[test]
    fn test_plan_is_stable() {
        let tmp = TempDir::new().unwrap();
        let roots = roots(&tmp);
        fs::create_dir_all(roots.mods.join("5")).unwrap();
        let manifest: Manifest = vec![
            desc("3", "b.txt", b"b"),
            desc("1", "a.crp", b"a"),
            desc("2", "c.dll", b"c"),
        ]
        .into_iter()
        .collect();
        let first = plan_for(&manifest, &Overrides::new(), &roots);
        let second = plan_for(&manifest, &Overrides::new(), &roots);
        assert_eq!(first, second);
    }
}
