//! Applier output parsing.
//!
//! The applier reports everything as free text on its standard streams. This
//! module turns that text into a [`ParsedOutput`] the reconciler can reason
//! about. Line patterns are order-insensitive; the two historical hash-error
//! forms are normalised to the same `(file, hash)` tuple.

use crate::HashError;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// How many lines after a panic line the `required by` attribution may trail.
const PANIC_LOOKAHEAD: usize = 5;

/// Structured view of one applier invocation's combined stdout/stderr.
#[derive(Debug, Default, Clone)]
pub struct ParsedOutput {
    /// Patch path (as printed by the applier) -> hash errors.
    pub hash_errors: HashMap<String, Vec<HashError>>,
    /// Patch path -> process error messages.
    pub process_errors: HashMap<String, Vec<String>>,
    /// Source files the applier reported as written.
    pub written_files: Vec<String>,
    /// Patch paths the applier demonstrably touched.
    pub processed_files: HashSet<String>,
    /// First patch the applier could not read, if any.
    pub failure_file: Option<String>,
    /// Whether a panic signature appeared anywhere in the output.
    pub had_panic: bool,
    /// The panic line itself, trimmed.
    pub panic_message: String,
    /// Basename of the patch being processed when the panic occurred.
    pub panic_file: Option<String>,
}

impl ParsedOutput {
    /// True when any file accumulated at least one hash error.
    pub fn has_hash_errors(&self) -> bool {
        !self.hash_errors.is_empty()
    }

    /// True when nothing at all was recognised in the output.
    pub fn is_empty(&self) -> bool {
        self.hash_errors.is_empty()
            && self.process_errors.is_empty()
            && self.written_files.is_empty()
            && self.failure_file.is_none()
            && !self.had_panic
    }
}

struct Patterns {
    hash_error: Regex,
    process_error: Regex,
    written_file: Regex,
    cannot_read: Regex,
    required_by: Regex,
    reading_diff: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        // Both forms: "<file>.qmd - Cannot resolve hash N" and
        // "Cannot resolve hash N required by <file>.qmd".
        hash_error: Regex::new(
            r"(?:(.+\.qmd) - Cannot resolve hash (\d+)|Cannot resolve hash (\d+) required by (.+\.qmd))",
        )
        .expect("invalid hash error regex"),
        process_error: Regex::new(r"\(On behalf of '(.+\.qmd)'\): (.+)")
            .expect("invalid process error regex"),
        written_file: Regex::new(r"Written file (.+\.qml) - (\d+) diff\(s\) applied")
            .expect("invalid written file regex"),
        cannot_read: Regex::new(r"Cannot read file (.+\.qmd)").expect("invalid read regex"),
        required_by: Regex::new(r"required by (.+\.qmd)").expect("invalid required-by regex"),
        reading_diff: Regex::new(r"Reading diff (.+\.qmd)").expect("invalid reading-diff regex"),
    })
}

/// Parses the applier's combined output into a [`ParsedOutput`].
pub fn parse_applier_output(output: &str) -> ParsedOutput {
    let pats = patterns();
    let mut result = ParsedOutput::default();
    let lines: Vec<&str> = output.lines().collect();

    if output.contains("panicked at") || output.contains("SIGABRT") {
        result.had_panic = true;
        attribute_panic(&mut result, &lines, pats);
    }

    for raw in &lines {
        let line = raw.trim();

        if let Some(caps) = pats.hash_error.captures(line) {
            let (file, hash) = if let (Some(file), Some(hash)) = (caps.get(1), caps.get(2)) {
                (file.as_str(), hash.as_str())
            } else if let (Some(hash), Some(file)) = (caps.get(3), caps.get(4)) {
                (file.as_str(), hash.as_str())
            } else {
                continue;
            };
            let hash_id: u64 = match hash.parse() {
                Ok(h) => h,
                Err(_) => continue,
            };
            result
                .hash_errors
                .entry(file.to_string())
                .or_default()
                .push(HashError {
                    hash_id,
                    error: line.to_string(),
                });
            result.processed_files.insert(file.to_string());
            debug!(file, hash_id, "parsed hash error");
        }

        if let Some(caps) = pats.process_error.captures(line) {
            let file = caps[1].to_string();
            result
                .process_errors
                .entry(file.clone())
                .or_default()
                .push(caps[2].to_string());
            result.processed_files.insert(file);
        }

        if let Some(caps) = pats.cannot_read.captures(line) {
            let file = caps[1].to_string();
            if result.failure_file.is_none() {
                debug!(file = %file, "detected LOAD failure");
                result.failure_file = Some(file);
            }
        }

        if let Some(caps) = pats.written_file.captures(line) {
            result.written_files.push(caps[1].to_string());
        }
    }

    result
}

/// Fills `panic_message` and `panic_file`.
///
/// The applier prints `Cannot resolve hash ... required by <file>!` shortly
/// after the panic line; when that is absent the last `Reading diff <file>`
/// before the panic identifies the file instead.
fn attribute_panic(result: &mut ParsedOutput, lines: &[&str], pats: &Patterns) {
    let panic_idx = match lines.iter().position(|l| l.contains("panicked at")) {
        Some(idx) => {
            result.panic_message = lines[idx].trim().to_string();
            idx
        }
        None => {
            // SIGABRT without a panic line; keep the signal line as message.
            if let Some(idx) = lines.iter().position(|l| l.contains("SIGABRT")) {
                result.panic_message = lines[idx].trim().to_string();
                idx
            } else {
                return;
            }
        }
    };

    for line in lines.iter().skip(panic_idx + 1).take(PANIC_LOOKAHEAD - 1) {
        if let Some(caps) = pats.required_by.captures(line) {
            result.panic_file = basename(&caps[1]);
            debug!(file = ?result.panic_file, "panic attributed via required-by");
            return;
        }
    }

    for line in lines[..panic_idx].iter().rev() {
        if let Some(caps) = pats.reading_diff.captures(line) {
            result.panic_file = basename(&caps[1]);
            debug!(file = ?result.panic_file, "panic attributed via Reading diff");
            return;
        }
    }
}

fn basename(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}
