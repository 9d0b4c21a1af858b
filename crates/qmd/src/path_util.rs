//! Lexical path helpers for LOAD resolution.
//!
//! Dependency targets routinely do not exist on disk (that is exactly what
//! the validator reports), so these helpers fold `.` and `..` without
//! touching the filesystem.

use std::path::{Component, Path, PathBuf};

/// Folds `.` and `..` components out of a path without resolving symlinks.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pop past the root of an absolute path.
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Expresses `target` relative to `base`, purely lexically.
///
/// Both paths must already be cleaned and either both absolute or both
/// relative. Returns `None` when they share no common prefix at all
/// (different roots), in which case callers fall back to the basename.
pub fn relative_to(base: &Path, target: &Path) -> Option<PathBuf> {
    let base: Vec<Component> = base.components().collect();
    let target_parts: Vec<Component> = target.components().collect();

    let common = base
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 {
        return None;
    }

    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for comp in &target_parts[common..] {
        out.push(comp.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_folds_dot_and_dotdot() {
        assert_eq!(clean_path(Path::new("/a/b/../c/./d")), Path::new("/a/c/d"));
        assert_eq!(clean_path(Path::new("a/./b")), Path::new("a/b"));
    }

    #[test]
    fn test_clean_does_not_escape_root() {
        assert_eq!(clean_path(Path::new("/a/../../b")), Path::new("/b"));
    }

    #[test]
    fn test_clean_relative_keeps_leading_parents() {
        assert_eq!(clean_path(Path::new("../x/../y")), Path::new("../y"));
    }

    #[test]
    fn test_clean_empty_is_dot() {
        assert_eq!(clean_path(Path::new("a/..")), Path::new("."));
    }

    #[test]
    fn test_relative_simple_descent() {
        let rel = relative_to(Path::new("/tmp/job"), Path::new("/tmp/job/sub/dep.qmd"));
        assert_eq!(rel.unwrap(), Path::new("sub/dep.qmd"));
    }

    #[test]
    fn test_relative_with_parent_hops() {
        let rel = relative_to(Path::new("/tmp/job/sub"), Path::new("/tmp/job/other/x.qmd"));
        assert_eq!(rel.unwrap(), Path::new("../other/x.qmd"));
    }

    #[test]
    fn test_relative_identical_is_dot() {
        let rel = relative_to(Path::new("/tmp/job"), Path::new("/tmp/job"));
        assert_eq!(rel.unwrap(), Path::new("."));
    }
}
