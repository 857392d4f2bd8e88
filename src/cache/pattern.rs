//! Invalidation patterns.
//!
//! A pattern is a literal prefix optionally followed by a suffix. The
//! suffix starts at the first regex metacharacter:
//!
//! - no suffix: exact key (`auth:user:42`)
//! - `*`: any remainder (`auth:user:42*`)
//! - anything else: a regex anchored to the remainder (`perm:7:.*`)
//!
//! A suffix that does not compile degrades to a plain prefix match, which
//! removes more than asked but never leaves a matching key behind.

use std::fmt;

use regex::Regex;
use tracing::warn;

const METACHARACTERS: &[char] = &[
    '*', '.', '?', '+', '(', ')', '[', ']', '{', '}', '|', '^', '$', '\\',
];

#[derive(Debug, Clone)]
enum Suffix {
    Exact,
    Any,
    /// The root key itself or anything below it (`root:...`).
    Subtree,
    Regex(Regex),
}

/// A compiled invalidation pattern.
#[derive(Debug, Clone)]
pub struct InvalidationPattern {
    prefix: String,
    suffix: Suffix,
}

impl InvalidationPattern {
    /// Parse the textual pattern syntax. Never fails.
    pub fn parse(pattern: &str) -> Self {
        let Some(split) = pattern.find(METACHARACTERS) else {
            return Self::exact(pattern);
        };

        let (prefix, suffix) = pattern.split_at(split);
        if suffix == "*" {
            return Self::prefix(prefix);
        }

        match Regex::new(&format!("^(?:{suffix})$")) {
            Ok(regex) => Self {
                prefix: prefix.to_string(),
                suffix: Suffix::Regex(regex),
            },
            Err(e) => {
                warn!(
                    "Invalid invalidation pattern suffix in '{}', falling back to prefix '{}': {}",
                    pattern, prefix, e
                );
                Self::prefix(prefix)
            }
        }
    }

    /// Match one key exactly.
    pub fn exact(key: impl Into<String>) -> Self {
        Self {
            prefix: key.into(),
            suffix: Suffix::Exact,
        }
    }

    /// Match every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: Suffix::Any,
        }
    }

    /// Match `root` and every key nested under it by a `:` segment.
    pub fn subtree(root: impl Into<String>) -> Self {
        Self {
            prefix: root.into(),
            suffix: Suffix::Subtree,
        }
    }

    /// The literal part of the pattern.
    pub fn literal_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, key: &str) -> bool {
        let Some(rest) = key.strip_prefix(self.prefix.as_str()) else {
            return false;
        };

        match &self.suffix {
            Suffix::Exact => rest.is_empty(),
            Suffix::Any => true,
            Suffix::Subtree => rest.is_empty() || rest.starts_with(':'),
            Suffix::Regex(regex) => regex.is_match(rest),
        }
    }
}

impl fmt::Display for InvalidationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.suffix {
            Suffix::Exact => f.write_str(&self.prefix),
            Suffix::Any => write!(f, "{}*", self.prefix),
            Suffix::Subtree => write!(f, "{}(:.*)?", self.prefix),
            Suffix::Regex(regex) => {
                // Strip the anchoring added by `parse`.
                let source = regex.as_str();
                let inner = source
                    .strip_prefix("^(?:")
                    .and_then(|s| s.strip_suffix(")$"))
                    .unwrap_or(source);
                write!(f, "{}{}", self.prefix, inner)
            }
        }
    }
}

impl From<&str> for InvalidationPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

impl From<String> for InvalidationPattern {
    fn from(pattern: String) -> Self {
        Self::parse(&pattern)
    }
}

impl From<&String> for InvalidationPattern {
    fn from(pattern: &String) -> Self {
        Self::parse(pattern)
    }
}

impl From<&InvalidationPattern> for InvalidationPattern {
    fn from(pattern: &InvalidationPattern) -> Self {
        pattern.clone()
    }
}
