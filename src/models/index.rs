//! Index names.

use crate::{Error, Result};
use std::fmt;

/// Maximum length of an index name.
///
/// Postgres identifiers are capped at 63 bytes; the table prefix is counted
/// separately by the Postgres driver.
pub const MAX_INDEX_NAME_LEN: usize = 63;

/// A validated, normalized index name.
///
/// Names are lower-cased and restricted to `[a-z0-9-]`, starting and ending
/// with an alphanumeric character. The same rules hold for every backend
/// (Azure AI Search is the strictest), so an index name is portable and
/// safe to interpolate as a quoted SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexName(String);

impl IndexName {
    /// Validates and normalizes an index name.
    pub fn parse(name: &str) -> Result<Self> {
        let normalized = name.trim().to_lowercase();

        if normalized.is_empty() {
            return Err(Error::InvalidInput("index name is empty".to_string()));
        }
        if normalized.len() > MAX_INDEX_NAME_LEN {
            return Err(Error::InvalidInput(format!(
                "index name '{normalized}' exceeds {MAX_INDEX_NAME_LEN} characters"
            )));
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::InvalidInput(format!(
                "index name '{normalized}' may only contain letters, digits and '-'"
            )));
        }
        if normalized.starts_with('-') || normalized.ends_with('-') || normalized.contains("--") {
            return Err(Error::InvalidInput(format!(
                "index name '{normalized}' has a misplaced '-'"
            )));
        }

        Ok(Self(normalized))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IndexName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
