//! Environment-backed configuration.
//!
//! Every key also honours a `{KEY}_FILE` indirection pointing at a file whose
//! trimmed contents supply the value, so secrets and paths can be mounted
//! rather than passed through the environment.

use std::path::PathBuf;

/// Default bound on concurrently running applier subprocesses.
pub const DEFAULT_MAX_CONCURRENT_VALIDATIONS: usize = 15;

/// Core service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of firmware hashtables (`HASHTAB_DIR`).
    pub hashtab_dir: PathBuf,
    /// Directory of unpacked QML source trees (`QML_TREE_DIR`).
    pub tree_dir: PathBuf,
    /// Path of the external applier binary (`APPLIER_BINARY`).
    pub applier_binary: PathBuf,
    /// Semaphore size for parallel validations (`MAX_CONCURRENT_VALIDATIONS`).
    pub max_concurrent_validations: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            hashtab_dir: PathBuf::from(env_or("HASHTAB_DIR", "./hashtables")),
            tree_dir: PathBuf::from(env_or("QML_TREE_DIR", "./qml-trees")),
            applier_binary: PathBuf::from(env_or("APPLIER_BINARY", "./qmldiff")),
            max_concurrent_validations: env_usize(
                "MAX_CONCURRENT_VALIDATIONS",
                DEFAULT_MAX_CONCURRENT_VALIDATIONS,
            ),
        }
    }
}

/// Reads `key`, falling back to the contents of the file named by
/// `{key}_FILE`, then to `default`.
pub fn env_or(key: &str, default: &str) -> String {
    env_value(key).unwrap_or_else(|| default.to_string())
}

/// Reads an integer key with the same lookup rules; unparseable values fall
/// back to the default.
pub fn env_usize(key: &str, default: usize) -> usize {
    env_value(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_value(key: &str) -> Option<String> {
    if let Ok(val) = std::env::var(key) {
        if !val.is_empty() {
            return Some(val);
        }
    }
    if let Ok(path) = std::env::var(format!("{key}_FILE")) {
        if let Ok(data) = std::fs::read_to_string(path) {
            return Some(data.trim().to_string());
        }
    }
    None
}
