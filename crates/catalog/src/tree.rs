//! QML source tree discovery and the tree catalog service.
//!
//! Each immediate subdirectory of the configured root is one source tree,
//! named `{osVersion}-{device}` like the hashtables it pairs with.

use crate::{parse_version, CatalogError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{info, warn};
use walkdir::WalkDir;

/// One unpacked QML source tree.
#[derive(Debug, Clone)]
pub struct SourceTree {
    /// Directory basename, e.g. `"3.22.0.65-rmpp"`.
    pub name: String,
    pub path: PathBuf,
    pub os_version: String,
    pub device: String,
    /// Number of `.qml` files anywhere under the tree (case-insensitive).
    pub file_count: usize,
}

impl SourceTree {
    /// Builds a tree record from its directory, counting `.qml` files.
    pub fn open(path: &Path) -> SourceTree {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let (os_version, device) = parse_version(&name);

        let file_count = WalkDir::new(path)
            .into_iter()
            .flatten()
            .filter(|e| {
                e.file_type().is_file()
                    && e.path()
                        .extension()
                        .and_then(|x| x.to_str())
                        .map(|x| x.eq_ignore_ascii_case("qml"))
                        .unwrap_or(false)
            })
            .count();

        SourceTree {
            name,
            path: path.to_path_buf(),
            os_version,
            device,
            file_count,
        }
    }
}

#[derive(Default)]
struct State {
    trees: Vec<Arc<SourceTree>>,
    mod_times: HashMap<PathBuf, SystemTime>,
}

/// Refresh-aware catalog of the source trees under a directory.
pub struct TreeService {
    dir: PathBuf,
    state: RwLock<State>,
}

impl TreeService {
    /// Discovers every tree under `dir`. A missing directory is created and
    /// the catalog starts empty.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let dir = dir.into();
        let service = Self {
            dir: dir.clone(),
            state: RwLock::new(State::default()),
        };

        if !dir.exists() {
            warn!(dir = %dir.display(), "tree directory does not exist, creating");
            std::fs::create_dir_all(&dir)?;
            return Ok(service);
        }

        let state = load_dir(&dir)?;
        *service.state.write().expect("tree lock poisoned") = state;
        Ok(service)
    }

    /// Snapshot of all discovered trees.
    pub fn trees(&self) -> Vec<Arc<SourceTree>> {
        self.state.read().expect("tree lock poisoned").trees.clone()
    }

    /// Looks a tree up by its directory name.
    pub fn get(&self, name: &str) -> Option<Arc<SourceTree>> {
        self.state
            .read()
            .expect("tree lock poisoned")
            .trees
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Number of discovered trees.
    pub fn count(&self) -> usize {
        self.state.read().expect("tree lock poisoned").trees.len()
    }

    /// Diffs the immediate subdirectories against the remembered state and
    /// rebuilds the catalog when membership or mtimes changed.
    pub fn check_and_reload(&self) -> Result<(), CatalogError> {
        let mut state = self.state.write().expect("tree lock poisoned");

        if !self.dir.exists() {
            if !state.trees.is_empty() {
                warn!(dir = %self.dir.display(), "tree directory removed, clearing catalog");
                *state = State::default();
            }
            return Ok(());
        }

        let mut current: HashMap<PathBuf, SystemTime> = HashMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
                current.insert(entry.path(), mtime);
            }
        }

        let changed = current.len() != state.mod_times.len()
            || current
                .iter()
                .any(|(path, mtime)| state.mod_times.get(path) != Some(mtime));
        if !changed {
            return Ok(());
        }

        info!(dir = %self.dir.display(), "detected tree changes, reloading");
        *state = load_dir(&self.dir)?;
        info!(count = state.trees.len(), "tree reload complete");
        Ok(())
    }
}

fn load_dir(dir: &Path) -> Result<State, CatalogError> {
    let mut state = State::default();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let tree = SourceTree::open(&entry.path());
        info!(
            name = %tree.name,
            files = tree.file_count,
            "discovered source tree"
        );

        if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
            state.mod_times.insert(entry.path(), mtime);
        }
        state.trees.push(Arc::new(tree));
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_dir(name: &str) -> PathBuf {
        let d = std::env::temp_dir().join(name);
        fs::remove_dir_all(&d).ok();
        fs::create_dir_all(&d).ok();
        d
    }

    #[test]
    fn test_open_counts_qml_case_insensitively() {
        let tmp = tmp_dir("catalog_tree_count");
        let tree_dir = tmp.join("3.22.0.65-rmpp");
        fs::create_dir_all(tree_dir.join("ui/nested")).ok();
        fs::write(tree_dir.join("ui/home.qml"), "Item {}").ok();
        fs::write(tree_dir.join("ui/nested/bar.QML"), "Item {}").ok();
        fs::write(tree_dir.join("ui/readme.txt"), "not qml").ok();

        let tree = SourceTree::open(&tree_dir);
        assert_eq!(tree.name, "3.22.0.65-rmpp");
        assert_eq!(tree.os_version, "3.22.0.65");
        assert_eq!(tree.device, "rmpp");
        assert_eq!(tree.file_count, 2);

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_missing_dir_creates_empty_catalog() {
        let tmp = std::env::temp_dir().join("catalog_tree_missing");
        fs::remove_dir_all(&tmp).ok();

        let service = TreeService::new(&tmp).unwrap();
        assert_eq!(service.count(), 0);
        assert!(tmp.exists());

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_only_directories_are_trees() {
        let tmp = tmp_dir("catalog_tree_files");
        fs::create_dir_all(tmp.join("1.0-rm2")).ok();
        fs::write(tmp.join("stray-file"), "x").ok();

        let service = TreeService::new(&tmp).unwrap();
        assert_eq!(service.count(), 1);
        assert!(service.get("1.0-rm2").is_some());

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_reload_tracks_membership() {
        let tmp = tmp_dir("catalog_tree_reload");
        fs::create_dir_all(tmp.join("1.0-rm2")).ok();

        let service = TreeService::new(&tmp).unwrap();
        assert_eq!(service.count(), 1);

        service.check_and_reload().unwrap();
        assert_eq!(service.count(), 1);

        fs::create_dir_all(tmp.join("2.0-rmpp")).ok();
        service.check_and_reload().unwrap();
        assert_eq!(service.count(), 2);

        fs::remove_dir_all(tmp.join("1.0-rm2")).ok();
        service.check_and_reload().unwrap();
        assert_eq!(service.count(), 1);
        assert!(service.get("2.0-rmpp").is_some());

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_directory_removed_entirely() {
        let tmp = tmp_dir("catalog_tree_gone");
        fs::create_dir_all(tmp.join("1.0-rm2")).ok();

        let service = TreeService::new(&tmp).unwrap();
        assert_eq!(service.count(), 1);

        fs::remove_dir_all(&tmp).ok();
        service.check_and_reload().unwrap();
        assert_eq!(service.count(), 0);
    }
}
