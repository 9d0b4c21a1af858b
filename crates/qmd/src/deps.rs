//! Patch dependency analysis.
//!
//! A patch can pull further patches in through `LOAD <path>` directives;
//! `LOAD EXTERNAL` names a symbolic dependency that is resolved elsewhere and
//! is ignored here. The analyzer walks that graph breadth-first and produces
//! the ordered closure the reconciler checks the applier's output against.

use crate::{path_util, DependencyError};
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// How deep a `LOAD` chain may nest before the analyzer gives up.
///
/// Chains are DAGs in practice (the visited set stops re-enqueueing), so the
/// cap only guards against pathological inputs.
const MAX_LOAD_DEPTH: usize = 100;

/// The transitive `LOAD` closure of one root patch.
#[derive(Debug, Clone)]
pub struct DependencyInfo {
    /// Absolute path of the root patch.
    pub root_file: PathBuf,
    /// Every loaded file, discovery order, deduplicated. Paths are relative
    /// to the root patch's directory; this normalized form is the key used
    /// everywhere downstream.
    pub expected_loads: Vec<String>,
    /// Normalized path -> index of first discovery.
    pub load_order: HashMap<String, usize>,
    /// Loading file (absolute path) -> the normalized paths it loads.
    pub load_graph: HashMap<String, Vec<String>>,
}

static LOAD_RE: OnceLock<Regex> = OnceLock::new();

fn load_re() -> &'static Regex {
    LOAD_RE.get_or_init(|| Regex::new(r"(?m)^LOAD\s+(\S+)").expect("invalid LOAD regex"))
}

/// Extracts the `LOAD` targets of a single patch file, in order of appearance.
///
/// `LOAD EXTERNAL ...` lines are skipped.
///
/// # Errors
/// Returns the underlying I/O error if the file cannot be read.
pub fn extract_load_statements(patch_path: &Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(patch_path)?;
    let loads: Vec<String> = load_re()
        .captures_iter(&content)
        .filter_map(|cap| {
            let target = cap[1].trim();
            if target.starts_with("EXTERNAL") {
                None
            } else {
                Some(target.to_string())
            }
        })
        .collect();

    debug!(
        patch = %patch_path.display(),
        count = loads.len(),
        "extracted LOAD statements"
    );
    Ok(loads)
}

/// Resolves a `LOAD` target relative to the file that contains the directive.
///
/// Matches the applier's own resolution: join onto the loading file's
/// directory, then fold `.`/`..` lexically.
pub fn resolve_load_path(loading_file: &Path, load_path: &str) -> PathBuf {
    let loading_dir = loading_file.parent().unwrap_or_else(|| Path::new(""));
    path_util::clean_path(&loading_dir.join(load_path))
}

/// Builds the complete dependency closure for a root patch.
///
/// Traversal is breadth-first; a visited set keyed on the resolved absolute
/// path prevents revisiting files reachable through several chains. Missing
/// dependency files are recorded and skipped; whether they matter is decided
/// later, when the applier's output is reconciled.
///
/// # Errors
/// - [`DependencyError::UnreadableRoot`] if the root patch cannot be read.
/// - [`DependencyError::DepthExceeded`] past [`MAX_LOAD_DEPTH`] levels.
pub fn build_dependency_info(root_path: &Path) -> Result<DependencyInfo, DependencyError> {
    let root_dir = root_path.parent().unwrap_or_else(|| Path::new(""));

    let mut expected_loads: Vec<String> = Vec::new();
    let mut load_order: HashMap<String, usize> = HashMap::new();
    let mut load_graph: HashMap<String, Vec<String>> = HashMap::new();
    let mut visited: HashSet<PathBuf> = HashSet::new();

    struct QueueItem {
        file_path: PathBuf,
        depth: usize,
    }

    let mut queue = VecDeque::new();
    queue.push_back(QueueItem {
        file_path: root_path.to_path_buf(),
        depth: 0,
    });
    visited.insert(path_util::clean_path(root_path));

    while let Some(current) = queue.pop_front() {
        if current.depth > MAX_LOAD_DEPTH {
            return Err(DependencyError::DepthExceeded {
                max: MAX_LOAD_DEPTH,
            });
        }

        let loads = match extract_load_statements(&current.file_path) {
            Ok(loads) => loads,
            Err(err) => {
                if current.depth == 0 {
                    return Err(DependencyError::UnreadableRoot {
                        path: current.file_path.display().to_string(),
                        source: err,
                    });
                }
                warn!(
                    file = %current.file_path.display(),
                    error = %err,
                    "cannot read LOAD dependency, skipping"
                );
                continue;
            }
        };

        let mut children: Vec<String> = Vec::new();

        for load_path in loads {
            let resolved = resolve_load_path(&current.file_path, &load_path);
            let normalized = normalize_against_root(root_dir, &resolved);

            children.push(normalized.clone());

            if visited.contains(&resolved) {
                debug!(path = %normalized, "already visited, not re-enqueueing");
                continue;
            }

            load_order.insert(normalized.clone(), expected_loads.len());
            expected_loads.push(normalized);
            visited.insert(resolved.clone());

            queue.push_back(QueueItem {
                file_path: resolved,
                depth: current.depth + 1,
            });
        }

        if !children.is_empty() {
            load_graph.insert(current.file_path.display().to_string(), children);
        }
    }

    info!(
        root = %root_path.display(),
        loads = expected_loads.len(),
        "built dependency closure"
    );

    Ok(DependencyInfo {
        root_file: root_path.to_path_buf(),
        expected_loads,
        load_order,
        load_graph,
    })
}

/// Re-expresses a resolved dependency path relative to the root patch's
/// directory; falls back to the basename when the two share no prefix.
fn normalize_against_root(root_dir: &Path, resolved: &Path) -> String {
    match path_util::relative_to(root_dir, resolved) {
        Some(rel) => rel.to_string_lossy().into_owned(),
        None => {
            warn!(
                path = %resolved.display(),
                root = %root_dir.display(),
                "cannot relativize dependency path, using basename"
            );
            resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| resolved.display().to_string())
        }
    }
}

/// Filters staged patches down to the root-level ones: files directly inside
/// `base_dir` with a (case-insensitive) `.qmd` extension. Patches in
/// subdirectories are only ever reached as dependencies.
pub fn root_level_files(base_dir: &Path, all_paths: &[PathBuf]) -> Vec<PathBuf> {
    let roots: Vec<PathBuf> = all_paths
        .iter()
        .filter(|path| {
            let rel = match path.strip_prefix(base_dir) {
                Ok(rel) => rel,
                Err(_) => return false,
            };
            let is_root_level = rel.components().count() == 1;
            let is_qmd = rel
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("qmd"))
                .unwrap_or(false);
            is_root_level && is_qmd
        })
        .cloned()
        .collect();

    info!(
        base = %base_dir.display(),
        count = roots.len(),
        "root-level patches"
    );
    roots
}
