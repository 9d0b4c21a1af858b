//! # QMD patch analysis
//!
//! **Role**: Everything the validator needs to know about a patch without
//! interpreting QML: which files a patch pulls in through `LOAD`, what the
//! applier said about each of them, and where a failing hash sits in the
//! patch text.
//!
//! **Core types**:
//! - [`DependencyInfo`]: the transitive `LOAD` closure of a root patch.
//! - [`ParsedOutput`]: structured view of the applier's combined output.
//! - [`ValidationResult`]: per-file outcome after reconciliation.
//! - [`HashWithPosition`]: a failing hash mapped back to line/column.

pub mod deps;
pub mod locate;
pub mod output;
pub mod path_util;
pub mod reconcile;

pub use deps::{build_dependency_info, resolve_load_path, root_level_files, DependencyInfo};
pub use locate::find_hash_positions;
pub use output::{parse_applier_output, ParsedOutput};
pub use reconcile::{reconcile, root_has_hash_errors};

use serde::{Deserialize, Serialize};

/// Validation status of a single patch file within one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// The applier processed the file without errors (or never mentioned it).
    Validated,
    /// The file had hash or process errors, was unreadable, or panicked.
    Failed,
    /// An earlier file's failure halted the applier before this file.
    NotAttempted,
}

/// A hash the applier could not resolve, with the raw diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashError {
    pub hash_id: u64,
    pub error: String,
}

/// Per-file outcome of reconciling expected dependencies against applier output.
///
/// Invariant: `compatible` holds exactly when `status == Validated`, and
/// `NotAttempted` entries always carry the path that blocked them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub path: String,
    pub status: FileStatus,
    pub compatible: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash_errors: Vec<HashError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub process_errors: Vec<String>,
    /// Index in LOAD discovery order; the root file is position -1.
    pub position: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

impl ValidationResult {
    fn clean(path: String, position: i32) -> Self {
        Self {
            path,
            status: FileStatus::Validated,
            compatible: true,
            hash_errors: Vec::new(),
            process_errors: Vec::new(),
            position,
            blocked_by: None,
        }
    }

    fn fail(&mut self) {
        self.status = FileStatus::Failed;
        self.compatible = false;
    }
}

/// A failing hash located in patch text (1-based line and column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashWithPosition {
    pub hash: u64,
    pub line: usize,
    pub column: usize,
}

/// Errors produced while building a patch's dependency closure.
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    /// The root patch itself could not be read.
    #[error("cannot read patch {path}: {source}")]
    UnreadableRoot {
        path: String,
        source: std::io::Error,
    },

    /// A `LOAD` chain recursed past the depth cap.
    #[error("LOAD nesting too deep (max {max} levels)")]
    DepthExceeded { max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&FileStatus::NotAttempted).unwrap(),
            "\"not_attempted\""
        );
        assert_eq!(
            serde_json::to_string(&FileStatus::Validated).unwrap(),
            "\"validated\""
        );
    }

    #[test]
    fn test_validation_result_omits_empty_collections() {
        let result = ValidationResult::clean("patch.qmd".into(), -1);
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("hash_errors"));
        assert!(!json.contains("process_errors"));
        assert!(!json.contains("blocked_by"));
        assert!(json.contains("\"position\":-1"));
    }
}
