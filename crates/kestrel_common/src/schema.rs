//! Table, column and index descriptors.
//!
//! These are the durable metadata records the DDL state machines mutate.
//! A descriptor is only visible to other nodes once the metastore commit
//! that wrote it succeeds, so every field here must round-trip through
//! serde.

use serde::{Deserialize, Serialize};

use crate::types::{CiName, ColumnKind, IndexId, TableId, MULTIPLE_KEY_FLAG, UNIQUE_KEY_FLAG};

/// Column metadata. The column list of a table is append-only in offset
/// order; offsets are stable for the life of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Stable column id, distinct from the offset.
    pub id: i64,
    pub name: CiName,
    /// Position in the table's column list.
    pub offset: usize,
    pub kind: ColumnKind,
    /// Advisory flag word (`UNIQUE_KEY_FLAG`, `MULTIPLE_KEY_FLAG`).
    pub flags: u32,
}

impl ColumnInfo {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn is_unique_key(&self) -> bool {
        self.has_flag(UNIQUE_KEY_FLAG)
    }

    pub fn is_multiple_key(&self) -> bool {
        self.has_flag(MULTIPLE_KEY_FLAG)
    }
}

/// One column reference inside an index descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: CiName,
    /// Offset of the referenced column in the table.
    pub offset: usize,
    /// Prefix length. `None` means the whole value is indexed; required
    /// for blob-like columns, forbidden for non-character non-blob ones.
    pub length: Option<usize>,
}

/// Lifecycle state of an index descriptor.
///
/// Every intermediate state imposes obligations on DML executors so that
/// no online reader or writer observes torn index state. The create path
/// walks `None → DeleteOnly → WriteOnly → WriteReorganization → Public`;
/// the drop path walks `Public → WriteOnly → DeleteOnly →
/// DeleteReorganization → (absent)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    /// Descriptor exists but DML must ignore it entirely.
    None,
    /// DML must delete matching entries on base-row delete/update and
    /// must not insert entries on insert/update.
    DeleteOnly,
    /// DML must maintain entries on all mutations and enforce uniqueness;
    /// readers must still ignore the index.
    WriteOnly,
    /// Same DML obligations as `WriteOnly`; a backfill from a snapshot
    /// older than this transition is in progress.
    WriteReorganization,
    /// Same DML obligations as `DeleteOnly`; a bulk delete of the index
    /// keyspace is in progress.
    DeleteReorganization,
    /// Fully usable for reads and writes.
    Public,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexState::None => "none",
            IndexState::DeleteOnly => "delete-only",
            IndexState::WriteOnly => "write-only",
            IndexState::WriteReorganization => "write-reorganization",
            IndexState::DeleteReorganization => "delete-reorganization",
            IndexState::Public => "public",
        };
        f.write_str(s)
    }
}

/// Secondary index descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Unique within the table, assigned once from `TableInfo::max_index_id`.
    pub id: IndexId,
    pub name: CiName,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
    pub state: IndexState,
}

/// Table descriptor: the unit the metastore persists and the state
/// machines mutate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: CiName,
    pub columns: Vec<ColumnInfo>,
    pub indices: Vec<IndexInfo>,
    /// Monotone counter for index id allocation. Never decremented, even
    /// when an index is dropped.
    pub max_index_id: i64,
}

impl TableInfo {
    pub fn find_column(&self, name: &str) -> Option<&ColumnInfo> {
        let lowered = name.to_lowercase();
        self.columns.iter().find(|c| c.name.lowered == lowered)
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexInfo> {
        let lowered = name.to_lowercase();
        self.indices.iter().find(|i| i.name.lowered == lowered)
    }

    pub fn find_index_mut(&mut self, name: &str) -> Option<&mut IndexInfo> {
        let lowered = name.to_lowercase();
        self.indices.iter_mut().find(|i| i.name.lowered == lowered)
    }

    /// Allocate a fresh index id by bumping `max_index_id`.
    pub fn allocate_index_id(&mut self) -> IndexId {
        self.max_index_id += 1;
        IndexId(self.max_index_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_columns() -> TableInfo {
        TableInfo {
            id: TableId(1),
            name: CiName::new("users"),
            columns: vec![
                ColumnInfo {
                    id: 10,
                    name: CiName::new("id"),
                    offset: 0,
                    kind: ColumnKind::Int,
                    flags: 0,
                },
                ColumnInfo {
                    id: 11,
                    name: CiName::new("Email"),
                    offset: 1,
                    kind: ColumnKind::VarChar,
                    flags: 0,
                },
            ],
            indices: vec![],
            max_index_id: 0,
        }
    }

    #[test]
    fn test_find_column_is_case_insensitive() {
        let tbl = table_with_columns();
        assert!(tbl.find_column("email").is_some());
        assert!(tbl.find_column("EMAIL").is_some());
        assert!(tbl.find_column("missing").is_none());
    }

    #[test]
    fn test_allocate_index_id_is_strictly_monotone() {
        let mut tbl = table_with_columns();
        let a = tbl.allocate_index_id();
        let b = tbl.allocate_index_id();
        assert_eq!(a, IndexId(1));
        assert_eq!(b, IndexId(2));
        assert_eq!(tbl.max_index_id, 2);
    }

    #[test]
    fn test_column_flag_helpers() {
        let mut col = table_with_columns().columns[0].clone();
        col.set_flag(UNIQUE_KEY_FLAG);
        assert!(col.is_unique_key());
        assert!(!col.is_multiple_key());
        col.clear_flag(UNIQUE_KEY_FLAG);
        assert_eq!(col.flags, 0);
    }

    #[test]
    fn test_descriptor_roundtrips_through_serde() {
        let mut tbl = table_with_columns();
        tbl.indices.push(IndexInfo {
            id: IndexId(1),
            name: CiName::new("idx_email"),
            columns: vec![IndexColumn {
                name: CiName::new("Email"),
                offset: 1,
                length: Some(16),
            }],
            unique: true,
            state: IndexState::WriteReorganization,
        });
        let json = serde_json::to_string(&tbl).unwrap();
        let back: TableInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tbl);
    }
}
