//! Tree snapshots and the change sets between them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub is_dir: bool,
    pub size: u64,
    /// Files only; directory mtimes move whenever a child changes.
    pub mtime: Option<SystemTime>,
}

/// Relative path → metadata for every visible file and directory under a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, EntryMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// `+A ~M -R`
    pub fn summary(&self) -> String {
        format!(
            "+{} ~{} -{}",
            self.added.len(),
            self.modified.len(),
            self.removed.len()
        )
    }
}

impl Snapshot {
    /// Walk `root`. Dot-entries (`.git`, `.gitkeep`) are not content and are
    /// skipped. A missing root is an empty snapshot.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if !root.exists() {
            return Ok(Self { entries });
        }
        let walker = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.with_context(|| format!("scanning {}", root.display()))?;
            let meta = entry
                .metadata()
                .with_context(|| format!("reading metadata of {}", entry.path().display()))?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .context("walked entry outside root")?
                .to_path_buf();
            let m = if meta.is_dir() {
                EntryMeta {
                    is_dir: true,
                    size: 0,
                    mtime: None,
                }
            } else {
                EntryMeta {
                    is_dir: false,
                    size: meta.len(),
                    mtime: meta.modified().ok(),
                }
            };
            entries.insert(rel, m);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// What changed going from `self` to `newer`. Paths come out sorted.
    pub fn diff(&self, newer: &Snapshot) -> ChangeSet {
        let mut cs = ChangeSet::default();
        for (path, meta) in &newer.entries {
            match self.entries.get(path) {
                None => cs.added.push(path.clone()),
                Some(old) if old != meta => cs.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.entries.keys() {
            if !newer.entries.contains_key(path) {
                cs.removed.push(path.clone());
            }
        }
        cs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn diff_tracks_adds_changes_and_removals() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Frontend/React")).unwrap();
        fs::write(root.join("Frontend/React/a.json"), b"{}").unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();

        let empty = Snapshot::default();
        let s1 = Snapshot::scan(root).unwrap();
        let first = empty.diff(&s1);
        assert_eq!(
            first.added,
            vec![
                PathBuf::from("Frontend"),
                PathBuf::from("Frontend/React"),
                PathBuf::from("Frontend/React/a.json"),
            ]
        );
        assert!(s1.diff(&s1).is_empty());

        fs::write(root.join("Frontend/React/a.json"), b"{\"k\": 1}").unwrap();
        fs::create_dir_all(root.join("Database")).unwrap();
        fs::remove_dir_all(root.join(".git")).unwrap();
        let s2 = Snapshot::scan(root).unwrap();
        let cs = s1.diff(&s2);
        assert_eq!(cs.added, vec![PathBuf::from("Database")]);
        assert_eq!(cs.modified, vec![PathBuf::from("Frontend/React/a.json")]);
        assert!(cs.removed.is_empty());
        assert_eq!(cs.summary(), "+1 ~1 -0");

        fs::remove_dir_all(root.join("Database")).unwrap();
        let s3 = Snapshot::scan(root).unwrap();
        assert_eq!(s2.diff(&s3).removed, vec![PathBuf::from("Database")]);
    }

    #[test]
    fn missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Snapshot::scan(&dir.path().join("nope")).unwrap().is_empty());
    }
}
