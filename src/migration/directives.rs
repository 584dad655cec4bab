//! Control directives embedded in migration scripts.
//!
//! A directive is a SQL line comment of the form
//!
//! ```sql
//! -- @TIDELINE AUDIT = false
//! -- @TIDELINE SKIP = true
//! -- @TIDELINE COMMENT = backfill invoices
//! ```
//!
//! Keys are case-insensitive. Resolution is a pure function of the script text and
//! the caller's explicit [`Directives`]; nothing here touches the database.

use super::error::DirectiveError;
use super::migration::Directives;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static DIRECTIVE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*--\s*@TIDELINE\s+([A-Za-z_]+)\s*=\s*(.*?)\s*$")
        .expect("directive pattern is valid")
});

/// Which source wins when `audit`/`skip` are given both explicitly and in the script.
///
/// `comment` is not affected: an embedded comment always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirectivePrecedence {
    #[default]
    Embedded,
    Explicit,
}

/// Directives after merging explicit and embedded sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDirectives {
    /// `false` marks a repeatable migration: executed every run, never recorded
    pub audit: bool,
    /// `true` acknowledges the migration without executing or recording it
    pub skip: bool,
    /// Replaces the migration's own comment when present
    pub comment: Option<String>,
}

impl Default for ResolvedDirectives {
    fn default() -> Self {
        Self {
            audit: true,
            skip: false,
            comment: None,
        }
    }
}

impl ResolvedDirectives {
    pub fn comment_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.comment.as_deref().unwrap_or(fallback)
    }
}

/// Extract the directives declared in a script. Later lines override earlier ones.
pub fn parse_embedded(script: &str) -> Result<Directives, DirectiveError> {
    let mut found = Directives::default();

    for (idx, line) in script.lines().enumerate() {
        let Some(caps) = DIRECTIVE_LINE.captures(line) else {
            continue;
        };
        let key = caps[1].to_ascii_uppercase();
        let value = unquote(&caps[2]);

        match key.as_str() {
            "AUDIT" => found.audit = Some(parse_bool(idx + 1, &key, value)?),
            "SKIP" => found.skip = Some(parse_bool(idx + 1, &key, value)?),
            "COMMENT" => found.comment = Some(value.to_string()),
            _ => log::warn!("ignoring unknown directive {key} on line {}", idx + 1),
        }
    }

    Ok(found)
}

/// Merge the explicit directives with those embedded in `script`.
pub fn resolve_directives(
    script: &str,
    explicit: &Directives,
    precedence: DirectivePrecedence,
) -> Result<ResolvedDirectives, DirectiveError> {
    let embedded = parse_embedded(script)?;
    let defaults = ResolvedDirectives::default();

    let pick = |embedded: Option<bool>, explicit: Option<bool>| match precedence {
        DirectivePrecedence::Embedded => embedded.or(explicit),
        DirectivePrecedence::Explicit => explicit.or(embedded),
    };

    Ok(ResolvedDirectives {
        audit: pick(embedded.audit, explicit.audit).unwrap_or(defaults.audit),
        skip: pick(embedded.skip, explicit.skip).unwrap_or(defaults.skip),
        comment: embedded.comment.or_else(|| explicit.comment.clone()),
    })
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_bool(line: usize, key: &str, value: &str) -> Result<bool, DirectiveError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DirectiveError {
            line,
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_script_resolves_to_defaults() {
        let resolved = resolve_directives(
            "CREATE TABLE foo (id INTEGER)",
            &Directives::default(),
            DirectivePrecedence::Embedded,
        )
        .unwrap();
        assert_eq!(resolved, ResolvedDirectives::default());
    }

    #[test]
    fn parses_all_embedded_directives() {
        let script = "-- @TIDELINE audit = FALSE\n\
                      --@tideline SKIP=true\n  \
                      -- @TIDELINE COMMENT = \"override\"\n\
                      SELECT 1;";
        let found = parse_embedded(script).unwrap();
        assert_eq!(found.audit, Some(false));
        assert_eq!(found.skip, Some(true));
        assert_eq!(found.comment.as_deref(), Some("override"));
    }

    #[test]
    fn embedded_comment_beats_explicit() {
        let explicit = Directives::default().comment("from caller");
        let resolved = resolve_directives(
            "-- @TIDELINE COMMENT = override\nSELECT 1",
            &explicit,
            DirectivePrecedence::Explicit,
        )
        .unwrap();
        assert_eq!(resolved.comment_or("field"), "override");

        let resolved =
            resolve_directives("SELECT 1", &explicit, DirectivePrecedence::Embedded).unwrap();
        assert_eq!(resolved.comment_or("field"), "from caller");

        let resolved = resolve_directives(
            "SELECT 1",
            &Directives::default(),
            DirectivePrecedence::Embedded,
        )
        .unwrap();
        assert_eq!(resolved.comment_or("field"), "field");
    }

    #[test]
    fn precedence_decides_conflicting_flags() {
        let script = "-- @TIDELINE AUDIT = false\n-- @TIDELINE SKIP = false\nSELECT 1";
        let explicit = Directives::default().audit(true).skip(true);

        let embedded_wins =
            resolve_directives(script, &explicit, DirectivePrecedence::Embedded).unwrap();
        assert!(!embedded_wins.audit);
        assert!(!embedded_wins.skip);

        let explicit_wins =
            resolve_directives(script, &explicit, DirectivePrecedence::Explicit).unwrap();
        assert!(explicit_wins.audit);
        assert!(explicit_wins.skip);
    }

    #[test]
    fn explicit_fills_gaps_under_either_precedence() {
        let explicit = Directives::default().audit(false);
        for precedence in [DirectivePrecedence::Embedded, DirectivePrecedence::Explicit] {
            let resolved = resolve_directives("SELECT 1", &explicit, precedence).unwrap();
            assert!(!resolved.audit);
            assert!(!resolved.skip);
        }
    }

    #[test]
    fn later_lines_override_earlier() {
        let found = parse_embedded("-- @TIDELINE SKIP = true\n-- @TIDELINE SKIP = false").unwrap();
        assert_eq!(found.skip, Some(false));
    }

    #[test]
    fn invalid_boolean_is_an_error() {
        let err = parse_embedded("SELECT 1;\n-- @TIDELINE AUDIT = maybe").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.key, "AUDIT");
        assert_eq!(err.value, "maybe");
    }

    #[test]
    fn unknown_keys_and_ordinary_comments_are_ignored() {
        let script = "-- @TIDELINE COLOUR = blue\n-- just a comment\n-- @OTHER AUDIT = false";
        let found = parse_embedded(script).unwrap();
        assert_eq!(found, Directives::default());
    }
}
