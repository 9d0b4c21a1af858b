//! # Firmware catalogs
//!
//! **Role**: Discover and hot-reload the two directory-backed data sets that
//! define the validation target matrix: hashtables (one binary file per
//! firmware variant) and QML source trees (one directory per variant).
//!
//! Both catalogs follow the same pattern: load everything at construction,
//! remember each entry's modification time, and let `check_and_reload`
//! cheaply diff the directory against that memory, rebuilding the in-memory
//! set atomically under a single writer lock only when something changed.
//! Reads are concurrent and hand out `Arc` snapshots.

pub mod hashtab;
pub mod tree;

pub use hashtab::{djb2_hash, write_hashlist, Hashtab, HashtabService, VERSION_SENTINEL};
pub use tree::{SourceTree, TreeService};

/// Errors from catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record stream ended in the middle of a record.
    #[error("truncated hashtable record in {path}")]
    TruncatedRecord { path: String },
}

/// Splits a `{osVersion}-{device}` name on the first `-`.
///
/// A name with no `-` keeps the whole string as the OS version and reports
/// the device as `"unknown"`.
pub(crate) fn parse_version(name: &str) -> (String, String) {
    match name.split_once('-') {
        Some((version, device)) => (version.to_string(), device.to_string()),
        None => (name.to_string(), "unknown".to_string()),
    }
}
