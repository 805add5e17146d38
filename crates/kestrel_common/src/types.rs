//! Core identifier and classification types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Schema (database) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaId(pub i64);

/// Table identifier, unique within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub i64);

/// Index identifier, unique within a table and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub i64);

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signed 64-bit row identifier, strictly increasing within a table's
/// record keyspace. Handle `0` is reserved: the backfill dispatcher's
/// next-handle channel uses it to signal "no more data", so real rows
/// always carry handles ≥ 1.
pub type Handle = i64;

/// A case-insensitive identifier. Keeps the original spelling for display
/// and a lowered form for comparison; equality and hashing use the lowered
/// form only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiName {
    pub origin: String,
    pub lowered: String,
}

impl CiName {
    pub fn new(name: impl Into<String>) -> Self {
        let origin = name.into();
        let lowered = origin.to_lowercase();
        Self { origin, lowered }
    }
}

impl PartialEq for CiName {
    fn eq(&self, other: &Self) -> bool {
        self.lowered == other.lowered
    }
}

impl Eq for CiName {}

impl std::hash::Hash for CiName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.lowered.hash(state);
    }
}

impl fmt::Display for CiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.origin)
    }
}

impl From<&str> for CiName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── Column flags ─────────────────────────────────────────────────────

/// Set on the sole column of a single-column unique `Public` index.
pub const UNIQUE_KEY_FLAG: u32 = 1 << 0;
/// Set on a column that leads at least one (non-sole-unique) index.
pub const MULTIPLE_KEY_FLAG: u32 = 1 << 1;

/// Physical type classification of a column, as far as index validation
/// cares: prefix lengths apply to character and blob-like columns only,
/// and blob-like columns cannot be indexed without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Int,
    Float,
    Char,
    VarChar,
    Text,
    Blob,
}

impl ColumnKind {
    /// Fixed- or variable-length character types.
    pub fn is_character(&self) -> bool {
        matches!(self, ColumnKind::Char | ColumnKind::VarChar)
    }

    /// Blob-like types (TEXT and BLOB): out-of-row payloads that may only
    /// be indexed through an explicit prefix length.
    pub fn is_blob(&self) -> bool {
        matches!(self, ColumnKind::Text | ColumnKind::Blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_name_equality_ignores_case() {
        let a = CiName::new("Idx_Users_Email");
        let b = CiName::new("idx_users_email");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "Idx_Users_Email");
    }

    #[test]
    fn test_ci_name_hash_matches_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(CiName::new("K1"));
        assert!(set.contains(&CiName::new("k1")));
    }

    #[test]
    fn test_column_kind_classification() {
        assert!(ColumnKind::Char.is_character());
        assert!(ColumnKind::VarChar.is_character());
        assert!(!ColumnKind::Text.is_character());
        assert!(ColumnKind::Text.is_blob());
        assert!(ColumnKind::Blob.is_blob());
        assert!(!ColumnKind::Int.is_blob());
        assert!(!ColumnKind::Int.is_character());
    }
}
