//! Composite keys for listing tables and range bounds for two-key scans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delimiter between the primary and secondary key in a serialized [`TwoKeys`].
pub const TWO_KEYS_DELIMITER: &str = "::";

/// Composite (primary, secondary) key for one-to-many listing tables.
///
/// # Format
///
/// Serializes as `"key::key2"`. Parsing splits on the FIRST delimiter, so a
/// primary key that itself contains `"::"` does not round-trip; the secondary
/// key may contain the delimiter freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TwoKeys {
    pub key: String,
    pub key2: String,
}

impl TwoKeys {
    pub fn new(key: impl Into<String>, key2: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            key2: key2.into(),
        }
    }

    /// Parse a serialized composite key. Returns `None` when the delimiter is absent.
    pub fn parse(s: &str) -> Option<Self> {
        let (key, key2) = s.split_once(TWO_KEYS_DELIMITER)?;
        Some(Self::new(key, key2))
    }

    /// True when `s` is a composite key whose primary part equals `key`.
    pub fn has_primary(s: &str, key: &str) -> bool {
        s.strip_prefix(key)
            .map(|rest| rest.starts_with(TWO_KEYS_DELIMITER))
            .unwrap_or(false)
            && !key.contains(TWO_KEYS_DELIMITER)
    }
}

impl fmt::Display for TwoKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, TWO_KEYS_DELIMITER, self.key2)
    }
}

impl FromStr for TwoKeys {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("missing '{}' in composite key: {}", TWO_KEYS_DELIMITER, s))
    }
}

/// Inclusive bounds on the secondary key of a two-key range scan.
///
/// `None` on either side means unbounded on that side. Empty strings are
/// normalized to `None` so that "nil", "empty" and "zero" all mean the same.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeInfo {
    pub start_value: Option<String>,
    pub end_value: Option<String>,
}

impl RangeInfo {
    pub fn new(start_value: Option<String>, end_value: Option<String>) -> Self {
        Self {
            start_value: start_value.filter(|s| !s.is_empty()),
            end_value: end_value.filter(|s| !s.is_empty()),
        }
    }

    /// A range without bounds on either side.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A range bounded below only.
    pub fn from_start(start: impl Into<String>) -> Self {
        Self::new(Some(start.into()), None)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start_value.is_none() && self.end_value.is_none()
    }

    /// Check whether a secondary key falls inside the range.
    pub fn contains(&self, key2: &str) -> bool {
        let above_start = self
            .start_value
            .as_deref()
            .map(|start| key2 >= start)
            .unwrap_or(true);
        let below_end = self
            .end_value
            .as_deref()
            .map(|end| key2 <= end)
            .unwrap_or(true);
        above_start && below_end
    }
}
