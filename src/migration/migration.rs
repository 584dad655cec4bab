//! The `Migration` input submitted to the runner

use super::checksum::calculate_checksum;
use chrono::{DateTime, Utc};

/// Namespace used when a migration does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Directives passed explicitly by the caller.
///
/// `None` means "not specified"; the resolved defaults are `audit = true`,
/// `skip = false` and no comment override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub audit: Option<bool>,
    pub skip: Option<bool>,
    pub comment: Option<String>,
}

impl Directives {
    pub fn audit(mut self, audit: bool) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A versioned script to apply exactly once within its namespace.
///
/// Immutable once built; the checksum is computed at construction.
///
/// ```
/// use tideline::migration::{Directives, Migration};
///
/// let migration = Migration::new(1, "CREATE TABLE users (id BIGINT PRIMARY KEY)")
///     .with_comment("create users")
///     .with_namespace("accounts")
///     .with_directives(Directives::default().audit(true));
///
/// assert_eq!(migration.namespace(), "accounts");
/// assert_eq!(migration.checksum().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    level: i64,
    namespace: String,
    script: String,
    comment: String,
    timestamp: DateTime<Utc>,
    directives: Directives,
    checksum: String,
}

impl Migration {
    pub fn new(level: i64, script: impl Into<String>) -> Self {
        let script = script.into();
        let checksum = calculate_checksum(&script);
        Self {
            level,
            namespace: DEFAULT_NAMESPACE.to_string(),
            script,
            comment: String::new(),
            timestamp: truncate_to_millis(Utc::now()),
            directives: Directives::default(),
            checksum,
        }
    }

    /// An empty namespace falls back to `"default"`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = if namespace.trim().is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            namespace
        };
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Millisecond precision so the instant round-trips through every backend.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = truncate_to_millis(timestamp);
        self
    }

    pub fn with_directives(mut self, directives: Directives) -> Self {
        self.directives = directives;
        self
    }

    pub fn level(&self) -> i64 {
        self.level
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn directives(&self) -> &Directives {
        &self.directives
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}
