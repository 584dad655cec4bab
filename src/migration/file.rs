//! Migration file discovery and parsing

use crate::migration::checksum::calculate_checksum;
use crate::migration::{Migration, MigrationError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

// <level>.<comment>.sql
static FILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\.(.+)\.sql$").expect("file name pattern is valid")
});

/// A migration script discovered on disk
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub path: PathBuf,
    pub level: i64,
    /// Taken verbatim from the file name
    pub comment: String,
    pub namespace: String,
    pub script: String,
    /// SHA-256 of the normalized script
    pub checksum: String,
}

impl MigrationFile {
    /// Split a file name into level and comment.
    ///
    /// `0003.add-user-email.sql` → `(3, "add-user-email")`
    pub fn parse_filename(filename: &str) -> Result<(i64, String), MigrationError> {
        let caps = FILE_NAME.captures(filename).ok_or_else(|| {
            MigrationError::InvalidFormat(format!(
                "Migration file name '{filename}' does not match <level>.<comment>.sql"
            ))
        })?;

        let level = caps[1].parse::<i64>().map_err(|e| {
            MigrationError::InvalidFormat(format!("Level in '{filename}' is not a valid i64: {e}"))
        })?;

        Ok((level, caps[2].to_string()))
    }

    /// Read and parse a single file.
    pub fn load(path: &Path, namespace: &str) -> Result<Self, MigrationError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                MigrationError::InvalidFormat(format!("Invalid filename: {}", path.display()))
            })?;
        let (level, comment) = Self::parse_filename(filename)?;

        let script = fs::read_to_string(path).map_err(|e| {
            MigrationError::InvalidFormat(format!("Failed to read {}: {e}", path.display()))
        })?;
        let checksum = calculate_checksum(&script);

        Ok(Self {
            path: path.to_path_buf(),
            level,
            comment,
            namespace: namespace.to_string(),
            script,
            checksum,
        })
    }

    pub fn to_migration(&self) -> Migration {
        Migration::new(self.level, self.script.clone())
            .with_namespace(self.namespace.clone())
            .with_comment(self.comment.clone())
    }
}

/// Discover every `*.sql` migration in `dir`, sorted by level.
///
/// Files without the `.sql` extension are ignored. A `.sql` file whose name does
/// not parse, or two files sharing a level, is an error.
pub fn discover_migrations(
    dir: &Path,
    namespace: &str,
) -> Result<Vec<MigrationFile>, MigrationError> {
    if !dir.exists() {
        return Err(MigrationError::FileNotFound(dir.display().to_string()));
    }
    if !dir.is_dir() {
        return Err(MigrationError::InvalidFormat(format!(
            "Path is not a directory: {}",
            dir.display()
        )));
    }

    let entries = fs::read_dir(dir).map_err(|e| {
        MigrationError::FileNotFound(format!(
            "Failed to read migrations directory {}: {e}",
            dir.display()
        ))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| {
                MigrationError::FileNotFound(format!("Failed to read directory entry: {e}"))
            })?
            .path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }
        files.push(MigrationFile::load(&path, namespace)?);
    }

    files.sort_by_key(|f| f.level);

    if let Some(pair) = files.windows(2).find(|w| w[0].level == w[1].level) {
        return Err(MigrationError::InvalidFormat(format!(
            "Level {} is used by both {} and {}",
            pair[0].level,
            pair[0].path.display(),
            pair[1].path.display()
        )));
    }

    log::debug!("discovered {} migration file(s) in {}", files.len(), dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) {
        fs::write(dir.path().join(name), body).unwrap();
    }

    #[test]
    fn parses_level_and_comment() {
        assert_eq!(
            MigrationFile::parse_filename("0003.add-user_email.sql").unwrap(),
            (3, "add-user_email".to_string())
        );
        assert_eq!(
            MigrationFile::parse_filename("20240120120000.v2.backfill.sql").unwrap(),
            (20240120120000, "v2.backfill".to_string())
        );
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["create.sql", "1.sql", "1.create.txt", "-1.create.sql"] {
            assert!(
                matches!(
                    MigrationFile::parse_filename(name),
                    Err(MigrationError::InvalidFormat(_))
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn discovers_sorted_sql_files_only() {
        let dir = TempDir::new().unwrap();
        write(&dir, "10.second.sql", "CREATE TABLE b (id INTEGER);");
        write(&dir, "2.first.sql", "CREATE TABLE a (id INTEGER);");
        write(&dir, "README.md", "not a migration");

        let files = discover_migrations(dir.path(), "billing").unwrap();
        let levels: Vec<i64> = files.iter().map(|f| f.level).collect();
        assert_eq!(levels, [2, 10]);
        assert_eq!(files[0].comment, "first");
        assert_eq!(files[0].namespace, "billing");
        assert_eq!(files[0].checksum, calculate_checksum("CREATE TABLE a (id INTEGER);"));

        let migration = files[1].to_migration();
        assert_eq!(migration.level(), 10);
        assert_eq!(migration.namespace(), "billing");
        assert_eq!(migration.comment(), "second");
        assert_eq!(migration.checksum(), files[1].checksum);
    }

    #[test]
    fn duplicate_levels_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "1.one.sql", "SELECT 1;");
        write(&dir, "01.also-one.sql", "SELECT 1;");

        let err = discover_migrations(dir.path(), "default").unwrap_err();
        assert!(err.to_string().contains("Level 1"));
    }

    #[test]
    fn missing_directory_is_file_not_found() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            discover_migrations(&missing, "default"),
            Err(MigrationError::FileNotFound(_))
        ));
    }
}
