//! Result reconciliation.
//!
//! The applier does not cleanly tag which output lines belong to which input
//! patch; path forms vary between absolute, relative and bare basenames.
//! All of that ambiguity is resolved here, once, with a fixed precedence:
//! exact path, then basename, then suffix match. Downstream code must not add
//! further heuristics.

use crate::deps::resolve_load_path;
use crate::output::ParsedOutput;
use crate::{DependencyInfo, FileStatus, HashError, ValidationResult};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// True when the applier attributed at least one hash error to the root
/// patch itself, under the same exact-path, basename, suffix precedence the
/// reconciler uses. Hash errors belonging only to dependencies do not count.
pub fn root_has_hash_errors(dep_info: &DependencyInfo, parsed: &ParsedOutput) -> bool {
    let root_name = basename(&dep_info.root_file);
    let root_abs = dep_info.root_file.display().to_string();
    !collect_hash_errors(parsed, &root_abs, &root_name).is_empty()
}

/// Combines the expected dependency closure with the applier's parsed output
/// into a per-file outcome map covering `{root} ∪ expected_loads`.
///
/// The root is keyed by its basename; dependencies by their normalized
/// relative paths. Once a dependency fails to load (or panics), every later
/// entry in `expected_loads` is `NotAttempted`: the applier short-circuits
/// the remaining `LOAD`s of that patch.
pub fn reconcile(
    dep_info: &DependencyInfo,
    parsed: &ParsedOutput,
) -> BTreeMap<String, ValidationResult> {
    let mut results = BTreeMap::new();

    let root_name = basename(&dep_info.root_file);
    let root_abs = dep_info.root_file.display().to_string();
    let mut root = ValidationResult::clean(root_name.clone(), -1);

    // A panic with no parseable hash errors and no identified file leaves
    // nothing to attribute: fail the root, block everything else.
    if parsed.had_panic && parsed.hash_errors.is_empty() && parsed.panic_file.is_none() {
        root.fail();
        root.process_errors
            .push(format!("qmldiff panicked: {}", parsed.panic_message));
        results.insert(root_name.clone(), root);

        for (i, expected) in dep_info.expected_loads.iter().enumerate() {
            results.insert(
                expected.clone(),
                ValidationResult {
                    path: expected.clone(),
                    status: FileStatus::NotAttempted,
                    compatible: false,
                    hash_errors: Vec::new(),
                    process_errors: Vec::new(),
                    position: i as i32,
                    blocked_by: Some(root_name.clone()),
                },
            );
        }

        info!(
            files = results.len(),
            "reconciled: fatal panic, nothing attempted"
        );
        return results;
    }

    // Root attribution: exact absolute path, then basename, then suffix.
    attach_hash_errors(&mut root, parsed, &root_abs, &root_name);
    attach_process_errors(&mut root, parsed, &root_abs, &root_name);
    if parsed.panic_file.as_deref() == Some(root_name.as_str()) {
        root.fail();
        root.process_errors
            .push(format!("qmldiff panicked: {}", parsed.panic_message));
    }

    debug!(
        compatible = root.compatible,
        hash_errors = root.hash_errors.len(),
        process_errors = root.process_errors.len(),
        "root reconciled"
    );
    results.insert(root_name, root);

    // Dependency walk in discovery order, propagating the first failure.
    let mut failure_point: i32 = -1;

    for (i, expected) in dep_info.expected_loads.iter().enumerate() {
        let resolved = resolve_load_path(&dep_info.root_file, expected)
            .display()
            .to_string();
        let mut result = ValidationResult::clean(expected.clone(), i as i32);

        if failure_point != -1 && (i as i32) > failure_point {
            result.status = FileStatus::NotAttempted;
            result.compatible = false;
            result.blocked_by =
                Some(dep_info.expected_loads[failure_point as usize].clone());
            results.insert(expected.clone(), result);
            continue;
        }

        let is_failure = parsed.failure_file.as_deref() == Some(expected.as_str())
            || parsed.failure_file.as_deref() == Some(resolved.as_str());
        let expected_base = basename(Path::new(expected));
        let is_panic_file = parsed.panic_file.as_deref() == Some(expected_base.as_str());
        let was_processed = parsed.processed_files.contains(expected)
            || parsed.processed_files.contains(&resolved);

        if is_failure {
            failure_point = i as i32;
            result.fail();
            result
                .process_errors
                .push("LOAD failed: Cannot read file".to_string());
        } else if is_panic_file {
            failure_point = i as i32;
            result.fail();
            result
                .process_errors
                .push(format!("qmldiff panicked: {}", parsed.panic_message));
        } else if was_processed {
            attach_hash_errors(&mut result, parsed, &resolved, expected);
            attach_process_errors(&mut result, parsed, &resolved, expected);
        }
        // Otherwise the applier never mentioned the file: silent success.

        results.insert(expected.clone(), result);
    }

    info!(
        files = results.len(),
        failure_point, "reconciled dependency results"
    );
    results
}

/// Hash errors recorded under any of the three key forms; suffix matching is
/// a fallback only.
fn collect_hash_errors(parsed: &ParsedOutput, exact: &str, short: &str) -> Vec<HashError> {
    let mut errs: Vec<HashError> = Vec::new();
    if let Some(found) = parsed.hash_errors.get(exact) {
        errs.extend(found.iter().cloned());
    }
    if exact != short {
        if let Some(found) = parsed.hash_errors.get(short) {
            errs.extend(found.iter().cloned());
        }
    }
    if errs.is_empty() {
        for (path, found) in &parsed.hash_errors {
            if path.ends_with(short) {
                errs.extend(found.iter().cloned());
                break;
            }
        }
    }
    errs
}

/// Attaches hash errors found under any of the three key forms, demoting the
/// result to failed on a hit.
fn attach_hash_errors(
    result: &mut ValidationResult,
    parsed: &ParsedOutput,
    exact: &str,
    short: &str,
) {
    result
        .hash_errors
        .extend(collect_hash_errors(parsed, exact, short));
    if !result.hash_errors.is_empty() {
        result.fail();
    }
}

/// Same precedence as [`attach_hash_errors`], for process errors.
fn attach_process_errors(
    result: &mut ValidationResult,
    parsed: &ParsedOutput,
    exact: &str,
    short: &str,
) {
    if let Some(errs) = parsed.process_errors.get(exact) {
        result.process_errors.extend(errs.iter().cloned());
        result.fail();
    }
    if exact != short {
        if let Some(errs) = parsed.process_errors.get(short) {
            result.process_errors.extend(errs.iter().cloned());
            result.fail();
        }
    }
    if result.process_errors.is_empty() {
        for (path, errs) in &parsed.process_errors {
            if path.ends_with(short) {
                result.process_errors.extend(errs.iter().cloned());
                result.fail();
                break;
            }
        }
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
