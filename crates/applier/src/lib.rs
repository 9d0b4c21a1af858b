//! # Applier adapter
//!
//! Wraps the external applier binary as a two-phase operation:
//!
//! 1. **Hash-compatibility check**: `check-compatibility <hashtab> <patch>`.
//!    Exit 0 means every hash resolves; exit 1 means at least one is missing
//!    (an expected outcome, not an operational failure).
//! 2. **Structural apply**: `apply-diffs --hashtab <hashtab> <in> <out>
//!    <patch>`. The canonical contract is in-place (`in == out`); to keep the
//!    catalog's tree pristine the adapter copies it into a scratch directory
//!    and applies in place on the copy.
//!
//! If phase 1 attributes a hash error to the root patch itself, phase 2 is
//! skipped and the phase-1 output is reconciled as the final result. Hash
//! errors belonging only to `LOAD`ed dependencies do not skip the structural
//! phase: the root still has an apply outcome worth reporting.
//!
//! The applier is single-threaded per invocation and safe to run as many
//! independent processes as the caller's semaphore allows.

use qmd::{
    build_dependency_info, parse_applier_output, reconcile, root_has_hash_errors,
    DependencyError, FileStatus, ParsedOutput, ValidationResult,
};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Errors from invoking or interpreting the applier.
#[derive(Debug, thiserror::Error)]
pub enum ApplierError {
    /// The binary could not be spawned at all.
    #[error("failed to spawn applier {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    /// A non-zero, non-1 exit with no recognisable output.
    #[error("applier failed (exit {code:?}): {snippet}")]
    UnexpectedExit { code: Option<i32>, snippet: String },

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of validating one root patch against one (hashtable, tree) pair.
#[derive(Debug, Clone)]
pub struct PatchValidation {
    /// Per-file outcomes for the root and its whole LOAD closure.
    pub dependency_results: BTreeMap<String, ValidationResult>,
    pub files_processed: usize,
    pub files_modified: usize,
    pub files_with_errors: usize,
    /// Hash IDs the root patch itself failed to resolve.
    pub failed_hashes: Vec<u64>,
    /// True when any file in the closure had hash errors.
    pub has_hash_errors: bool,
}

/// Handle on the external applier binary.
#[derive(Debug, Clone)]
pub struct Applier {
    binary: PathBuf,
}

impl Applier {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs both phases for one root patch and reconciles the output against
    /// the patch's dependency closure.
    pub fn validate_patch(
        &self,
        patch_path: &Path,
        hashtab_path: &Path,
        tree_path: &Path,
    ) -> Result<PatchValidation, ApplierError> {
        let dep_info = build_dependency_info(patch_path)?;
        info!(
            patch = %patch_path.display(),
            loads = dep_info.expected_loads.len(),
            "validating patch with dependency tracking"
        );

        // Phase A: hash compatibility. Only a hash error attributed to the
        // root patch itself short-circuits the structural phase; dependency
        // hash errors are re-reported (and reconciled) during the apply.
        let phase_a = self.check_compatibility(hashtab_path, patch_path)?;
        if root_has_hash_errors(&dep_info, &phase_a) {
            debug!(
                patch = %patch_path.display(),
                "root hash errors found, skipping structural apply"
            );
            let results = reconcile(&dep_info, &phase_a);
            return Ok(summarize(results));
        }

        // Phase B: structural apply, in place on a scratch copy of the tree.
        let scratch = tempfile::tempdir()?;
        let tree_copy = scratch.path().join("tree");
        copy_tree(tree_path, &tree_copy)?;

        let phase_b = self.apply_diffs(hashtab_path, &tree_copy, &tree_copy, patch_path)?;
        let results = reconcile(&dep_info, &phase_b);

        let summary = summarize(results);
        info!(
            patch = %patch_path.display(),
            processed = summary.files_processed,
            errors = summary.files_with_errors,
            "patch validation complete"
        );
        Ok(summary)
    }

    /// Phase A. Exit 1 is an expected "hashes missing" outcome; any other
    /// non-zero exit is an operational failure.
    pub fn check_compatibility(
        &self,
        hashtab_path: &Path,
        patch_path: &Path,
    ) -> Result<ParsedOutput, ApplierError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("check-compatibility").arg(hashtab_path).arg(patch_path);

        let (status, output) = self.run(cmd)?;
        let text = String::from_utf8_lossy(&output);
        let parsed = parse_applier_output(&text);

        match status.code() {
            Some(0) | Some(1) => Ok(parsed),
            code => Err(ApplierError::UnexpectedExit {
                code,
                snippet: snippet(&text),
            }),
        }
    }

    /// Phase B. Panics are detected from the output, not the exit code; an
    /// unrecognised non-zero exit with nothing parseable is an error.
    pub fn apply_diffs(
        &self,
        hashtab_path: &Path,
        tree_in: &Path,
        tree_out: &Path,
        patch_path: &Path,
    ) -> Result<ParsedOutput, ApplierError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("apply-diffs")
            .arg("--hashtab")
            .arg(hashtab_path)
            .arg(tree_in)
            .arg(tree_out)
            .arg(patch_path);

        let (status, output) = self.run(cmd)?;
        let text = String::from_utf8_lossy(&output);
        let parsed = parse_applier_output(&text);

        if !matches!(status.code(), Some(0) | Some(1)) && parsed.is_empty() {
            warn!(
                patch = %patch_path.display(),
                code = ?status.code(),
                "applier exited abnormally with no parseable output"
            );
            return Err(ApplierError::UnexpectedExit {
                code: status.code(),
                snippet: snippet(&text),
            });
        }

        Ok(parsed)
    }

    fn run(&self, cmd: Command) -> Result<(ExitStatus, Vec<u8>), ApplierError> {
        run_combined(cmd).map_err(|source| ApplierError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })
    }
}

/// Runs a command with stdout and stderr sharing a single pipe, preserving
/// the interleaving of the panic line and the error lines that follow it.
fn run_combined(mut cmd: Command) -> std::io::Result<(ExitStatus, Vec<u8>)> {
    let (mut reader, writer) = std::io::pipe()?;
    cmd.stdout(writer.try_clone()?);
    cmd.stderr(writer);

    let mut child = cmd.spawn()?;
    // The Command still holds both writer halves; drop it so the reader sees
    // EOF once the child exits.
    drop(cmd);

    let mut output = Vec::new();
    reader.read_to_end(&mut output)?;
    let status = child.wait()?;
    Ok((status, output))
}

/// Aggregates per-file outcomes into the cell-level counts.
fn summarize(results: BTreeMap<String, ValidationResult>) -> PatchValidation {
    let mut files_processed = 0;
    let mut files_modified = 0;
    let mut files_with_errors = 0;
    let mut failed_hashes = Vec::new();
    let mut has_hash_errors = false;

    for result in results.values() {
        match result.status {
            FileStatus::Validated | FileStatus::Failed => {
                files_processed += 1;
                files_modified += 1;
            }
            FileStatus::NotAttempted => {}
        }
        if !result.compatible {
            files_with_errors += 1;
        }
        if !result.hash_errors.is_empty() {
            has_hash_errors = true;
        }
        if result.position == -1 {
            failed_hashes.extend(result.hash_errors.iter().map(|e| e.hash_id));
        }
    }

    PatchValidation {
        dependency_results: results,
        files_processed,
        files_modified,
        files_with_errors,
        failed_hashes,
        has_hash_errors,
    }
}

/// Recursively copies a source tree, preserving relative layout.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn snippet(text: &str) -> String {
    const MAX: usize = 400;
    let trimmed = text.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        let mut end = MAX;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}
