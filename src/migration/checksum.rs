//! Checksum calculation for migration scripts

use sha2::{Digest, Sha256};

/// Normalize a script so cosmetic differences don't count as drift.
///
/// Line endings become `\n`, trailing whitespace is stripped from every line and
/// leading/trailing blank lines are dropped. Interior content is untouched.
pub fn normalize_script(script: &str) -> String {
    let lines: Vec<&str> = script.lines().map(str::trim_end).collect();
    let first = lines.iter().position(|l| !l.is_empty());
    let last = lines.iter().rposition(|l| !l.is_empty());

    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

/// Hexadecimal SHA-256 of the normalized script.
///
/// Content-only, so it is stable across processes and restarts; it is the sole
/// signal that tells "unchanged, skip" from "changed, re-apply".
pub fn calculate_checksum(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_script(script).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_hex_sha256() {
        let sum = calculate_checksum("CREATE TABLE foo (id INTEGER)");
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn line_endings_and_trailing_space_do_not_matter() {
        let unix = "CREATE TABLE foo (id INTEGER);\nINSERT INTO foo VALUES (1);";
        let windows =
            "\r\n  \r\nCREATE TABLE foo (id INTEGER);   \r\nINSERT INTO foo VALUES (1);\r\n\r\n";
        assert_eq!(calculate_checksum(unix), calculate_checksum(windows));
    }

    #[test]
    fn content_changes_do() {
        assert_ne!(
            calculate_checksum("CREATE TABLE foo (id INTEGER)"),
            calculate_checksum("CREATE TABLE foo (id BIGINT)")
        );
        // Leading indentation is content
        assert_ne!(calculate_checksum("SELECT 1"), calculate_checksum("  SELECT 1"));
    }

    #[test]
    fn blank_script_normalizes_to_empty() {
        assert_eq!(normalize_script(" \n\t\n"), "");
        assert_eq!(calculate_checksum(""), calculate_checksum("\n\n"));
    }
}
