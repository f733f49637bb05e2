//! The crash history artifact: newline-delimited epoch milliseconds.

use tracing::debug;

/// Name of the history artifact in the store.
pub const HISTORY_FILE: &str = "crash_history.txt";

/// Parse a history document. Blank, malformed and non-positive lines are
/// skipped.
pub fn parse(text: &str) -> Vec<i64> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match line.parse::<i64>() {
                Ok(t) if t > 0 => Some(t),
                _ => {
                    debug!(line, "skipping corrupt crash history line");
                    None
                }
            }
        })
        .collect()
}

pub fn render(entries: &[i64]) -> String {
    entries.iter().map(|t| format!("{t}\n")).collect()
}

/// Combine two histories into one chronological list.
pub fn merge_chronological(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut merged = [a, b].concat();
    merged.sort_unstable();
    merged
}
