//! Table and index handles over the key codec.

use kestrel_common::datum::Datum;
use kestrel_common::error::KvError;
use kestrel_common::schema::{ColumnInfo, IndexInfo, TableInfo};
use kestrel_common::types::{Handle, TableId};
use kestrel_kv::{codec, Snapshot, Transaction};

/// A table as the backfill sees it: descriptor plus its record keyspace.
pub struct Table {
    info: TableInfo,
    record_prefix: Vec<u8>,
}

impl Table {
    pub fn new(info: TableInfo) -> Self {
        let record_prefix = codec::encode_table_record_prefix(info.id);
        Self {
            info,
            record_prefix,
        }
    }

    pub fn meta(&self) -> &TableInfo {
        &self.info
    }

    pub fn cols(&self) -> &[ColumnInfo] {
        &self.info.columns
    }

    /// Prefix covering every record key of this table.
    pub fn record_prefix(&self) -> &[u8] {
        &self.record_prefix
    }

    /// Key of the base row identified by `handle`.
    pub fn record_key(&self, handle: Handle) -> Vec<u8> {
        codec::encode_record_key(self.info.id, handle)
    }
}

/// Entry-level operations on one secondary index.
pub struct TableIndex {
    table_id: TableId,
    info: IndexInfo,
    prefix: Vec<u8>,
}

impl TableIndex {
    pub fn new(table_id: TableId, info: IndexInfo) -> Self {
        let prefix = codec::encode_table_index_prefix(table_id, info.id);
        Self {
            table_id,
            info,
            prefix,
        }
    }

    pub fn meta(&self) -> &IndexInfo {
        &self.info
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Prefix covering every entry of this index.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Apply declared prefix lengths to the indexed values.
    fn truncated(&self, values: &[Datum]) -> Vec<Datum> {
        values
            .iter()
            .zip(self.info.columns.iter())
            .map(|(v, ic)| match (ic.length, v) {
                (Some(l), Datum::Str(s)) => Datum::Str(s.chars().take(l).collect()),
                (Some(l), Datum::Bytes(b)) => {
                    Datum::Bytes(b.iter().copied().take(l).collect())
                }
                _ => v.clone(),
            })
            .collect()
    }

    fn unique_key(&self, values: &[Datum]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&codec::encode_index_values(&self.truncated(values)));
        key
    }

    fn nonunique_key(&self, values: &[Datum], handle: Handle) -> Vec<u8> {
        let mut key = self.unique_key(values);
        codec::encode_datum(&Datum::Int64(handle), &mut key);
        key
    }

    /// Write the index entry for `(values, handle)`.
    ///
    /// For a unique index an existing entry fails with
    /// [`KvError::KeyExists`] carrying the handle that owns it; when that
    /// handle equals the caller's own, the entry was written by concurrent
    /// DML racing ahead of the scan and the caller may skip it.
    pub fn create(
        &self,
        txn: &mut dyn Transaction,
        values: &[Datum],
        handle: Handle,
    ) -> Result<(), KvError> {
        if self.info.unique {
            let key = self.unique_key(values);
            if let Some(existing) = txn.get(&key) {
                let owner = codec::decode_handle_value(&existing)?;
                return Err(KvError::KeyExists { handle: owner });
            }
            txn.set(&key, codec::encode_handle_value(handle));
        } else {
            let key = self.nonunique_key(values, handle);
            if txn.get(&key).is_some() {
                return Err(KvError::KeyExists { handle });
            }
            txn.set(&key, codec::encode_handle_value(handle));
        }
        Ok(())
    }

    /// Remove the index entry for `(values, handle)`.
    pub fn delete(&self, txn: &mut dyn Transaction, values: &[Datum], handle: Handle) {
        let key = if self.info.unique {
            self.unique_key(values)
        } else {
            self.nonunique_key(values, handle)
        };
        txn.delete(&key);
    }

    /// Number of entries under this index's prefix in `snap`.
    pub fn entry_count(&self, snap: &dyn Snapshot) -> usize {
        let mut it = snap.seek(&self.prefix);
        let mut count = 0;
        while it.valid() && it.key().starts_with(&self.prefix) {
            count += 1;
            if it.next().is_err() {
                break;
            }
        }
        count
    }

    /// Handle owning the entry for `values`, if any (unique indexes).
    pub fn lookup(&self, snap: &dyn Snapshot, values: &[Datum]) -> Option<Handle> {
        snap.get(&self.unique_key(values))
            .and_then(|v| codec::decode_handle_value(&v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::schema::{IndexColumn, IndexState};
    use kestrel_common::types::{CiName, IndexId};
    use kestrel_kv::{KvStore, MemStore};

    fn index(unique: bool, length: Option<usize>) -> TableIndex {
        TableIndex::new(
            TableId(1),
            IndexInfo {
                id: IndexId(1),
                name: CiName::new("idx"),
                columns: vec![IndexColumn {
                    name: CiName::new("c"),
                    offset: 0,
                    length,
                }],
                unique,
                state: IndexState::WriteOnly,
            },
        )
    }

    #[test]
    fn test_unique_create_detects_foreign_duplicate() {
        let store = MemStore::new();
        let idx = index(true, None);
        let mut txn = store.begin();
        idx.create(txn.as_mut(), &[Datum::Int64(5)], 1).unwrap();
        let err = idx.create(txn.as_mut(), &[Datum::Int64(5)], 2).unwrap_err();
        assert!(matches!(err, KvError::KeyExists { handle: 1 }));
        txn.commit().unwrap();

        let snap = store.get_snapshot(store.current_version()).unwrap();
        assert_eq!(idx.lookup(snap.as_ref(), &[Datum::Int64(5)]), Some(1));
    }

    #[test]
    fn test_unique_create_reports_own_handle() {
        let store = MemStore::new();
        let idx = index(true, None);
        let mut txn = store.begin();
        idx.create(txn.as_mut(), &[Datum::Int64(5)], 3).unwrap();
        let err = idx.create(txn.as_mut(), &[Datum::Int64(5)], 3).unwrap_err();
        assert!(matches!(err, KvError::KeyExists { handle: 3 }));
    }

    #[test]
    fn test_nonunique_allows_shared_values() {
        let store = MemStore::new();
        let idx = index(false, None);
        let mut txn = store.begin();
        idx.create(txn.as_mut(), &[Datum::Int64(5)], 1).unwrap();
        idx.create(txn.as_mut(), &[Datum::Int64(5)], 2).unwrap();
        txn.commit().unwrap();

        let snap = store.get_snapshot(store.current_version()).unwrap();
        assert_eq!(idx.entry_count(snap.as_ref()), 2);
    }

    #[test]
    fn test_delete_removes_entry() {
        let store = MemStore::new();
        let idx = index(false, None);
        let mut txn = store.begin();
        idx.create(txn.as_mut(), &[Datum::Int64(5)], 1).unwrap();
        idx.delete(txn.as_mut(), &[Datum::Int64(5)], 1);
        txn.commit().unwrap();

        let snap = store.get_snapshot(store.current_version()).unwrap();
        assert_eq!(idx.entry_count(snap.as_ref()), 0);
    }

    #[test]
    fn test_prefix_length_folds_long_values() {
        let store = MemStore::new();
        let idx = index(true, Some(4));
        let mut txn = store.begin();
        idx.create(txn.as_mut(), &[Datum::Str("abcdef".into())], 1)
            .unwrap();
        // Shares the first 4 chars: collides under the prefix index.
        let err = idx
            .create(txn.as_mut(), &[Datum::Str("abcdzz".into())], 2)
            .unwrap_err();
        assert!(matches!(err, KvError::KeyExists { handle: 1 }));
    }
}
