//! Aggregated response shapes.
//!
//! These mirror the wire format the façade serves: per-hashtable cells sorted
//! into compatible/incompatible buckets, hash values rendered as decimal
//! strings, and empty collections omitted.

use qmd::{HashWithPosition, ValidationResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Tree,
    Hash,
}

/// A failing hash with its location in the patch text. Hashes serialize as
/// strings so 64-bit values survive JSON consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingHash {
    #[serde(with = "hash_string")]
    pub hash: u64,
    pub line: usize,
    pub column: usize,
}

impl From<HashWithPosition> for MissingHash {
    fn from(pos: HashWithPosition) -> Self {
        Self {
            hash: pos.hash,
            line: pos.line,
            column: pos.column,
        }
    }
}

/// One (patch × hashtable) validation cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellResult {
    pub hashtable: String,
    pub os_version: String,
    pub device: String,
    pub compatible: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_hashes: Vec<MissingHash>,
    pub validation_mode: ValidationMode,
    pub tree_validation_used: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub files_processed: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub files_modified: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub files_with_errors: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependency_results: BTreeMap<String, ValidationResult>,
}

impl CellResult {
    /// Skeleton cell for a hashtable, tree-mode by default.
    pub fn new(hashtable: &str, os_version: &str, device: &str) -> Self {
        Self {
            hashtable: hashtable.to_string(),
            os_version: os_version.to_string(),
            device: device.to_string(),
            compatible: false,
            error_detail: String::new(),
            missing_hashes: Vec::new(),
            validation_mode: ValidationMode::Tree,
            tree_validation_used: true,
            files_processed: 0,
            files_modified: 0,
            files_with_errors: 0,
            dependency_results: BTreeMap::new(),
        }
    }
}

/// Per-file aggregate: every cell for one patch, bucketed by compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareResponse {
    pub compatible: Vec<CellResult>,
    pub incompatible: Vec<CellResult>,
    pub total_checked: usize,
    pub mode: ValidationMode,
}

impl CompareResponse {
    pub fn empty(mode: ValidationMode) -> Self {
        Self {
            compatible: Vec::new(),
            incompatible: Vec::new(),
            total_checked: 0,
            mode,
        }
    }

    pub fn push(&mut self, cell: CellResult) {
        if cell.compatible {
            self.compatible.push(cell);
        } else {
            self.incompatible.push(cell);
        }
        self.total_checked += 1;
    }

    pub fn from_cells(cells: Vec<CellResult>, mode: ValidationMode) -> Self {
        let mut response = Self::empty(mode);
        for cell in cells {
            response.push(cell);
        }
        response
    }
}

/// The final job payload: flat for a lone dependency-free patch, otherwise a
/// map from file path to its own response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidationReport {
    Single(CompareResponse),
    Batch(BTreeMap<String, CompareResponse>),
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

mod hash_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hash.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_hash_serializes_as_string() {
        let missing = MissingHash {
            hash: 17607111715072197239,
            line: 3,
            column: 9,
        };
        let json = serde_json::to_string(&missing).unwrap();
        assert!(json.contains("\"hash\":\"17607111715072197239\""));

        let back: MissingHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, missing);
    }

    #[test]
    fn test_cell_omits_empty_fields() {
        let cell = CellResult::new("1.0-rm2", "1.0", "rm2");
        let json = serde_json::to_string(&cell).unwrap();
        assert!(!json.contains("error_detail"));
        assert!(!json.contains("missing_hashes"));
        assert!(!json.contains("files_processed"));
        assert!(!json.contains("dependency_results"));
        assert!(json.contains("\"validation_mode\":\"tree\""));
    }

    #[test]
    fn test_push_buckets_by_compatibility() {
        let mut response = CompareResponse::empty(ValidationMode::Tree);
        let mut ok = CellResult::new("a-x", "a", "x");
        ok.compatible = true;
        response.push(ok);
        response.push(CellResult::new("b-y", "b", "y"));

        assert_eq!(response.compatible.len(), 1);
        assert_eq!(response.incompatible.len(), 1);
        assert_eq!(response.total_checked, 2);
    }

    #[test]
    fn test_report_untagged_shapes() {
        let single = ValidationReport::Single(CompareResponse::empty(ValidationMode::Tree));
        let value = serde_json::to_value(&single).unwrap();
        assert!(value.get("compatible").is_some());

        let mut map = BTreeMap::new();
        map.insert(
            "mod.qmd".to_string(),
            CompareResponse::empty(ValidationMode::Tree),
        );
        let batch = ValidationReport::Batch(map);
        let value = serde_json::to_value(&batch).unwrap();
        assert!(value.get("mod.qmd").is_some());
    }
}
