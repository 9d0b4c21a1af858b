//! Hash-position location.
//!
//! Maps failed hash IDs back to line/column positions in the patch text so
//! diagnostics can point at the offending reference. The scan is purely
//! textual: it probes for the decimal representation of each hash without
//! interpreting the surrounding syntax. Hash values are effectively random
//! 64-bit numbers, so false positives are rare and acceptable; the result
//! is diagnostic only.

use crate::HashWithPosition;

/// Finds the first occurrence of each target hash's decimal representation.
///
/// One pass over the content, tracking 1-based line and column; a newline
/// increments the line and resets the column without advancing it. Each hash
/// is reported at most once, at its first occurrence; hashes that never
/// appear are simply absent from the result.
pub fn find_hash_positions(content: &str, targets: &[u64]) -> Vec<HashWithPosition> {
    if targets.is_empty() {
        return Vec::new();
    }

    let mut seen = std::collections::HashSet::new();
    let mut remaining: Vec<(String, u64)> = targets
        .iter()
        .filter(|&&hash| seen.insert(hash))
        .map(|&hash| (hash.to_string(), hash))
        .collect();

    let mut results = Vec::with_capacity(remaining.len());
    let bytes = content.as_bytes();
    let mut line = 1usize;
    let mut col = 1usize;

    for i in 0..bytes.len() {
        if bytes[i] == b'\n' {
            line += 1;
            col = 1;
            continue;
        }

        if let Some(idx) = remaining
            .iter()
            .position(|(text, _)| bytes[i..].starts_with(text.as_bytes()))
        {
            let (_, hash) = remaining.swap_remove(idx);
            results.push(HashWithPosition { hash, line, column: col });
            if remaining.is_empty() {
                break;
            }
        }

        col += 1;
    }

    results
}
