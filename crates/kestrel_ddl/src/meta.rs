//! Metastore: descriptor persistence inside the key-value store.
//!
//! Everything lives under the reserved `m:` keyspace as serde_json
//! payloads: table descriptors, the global schema version counter, reorg
//! checkpoints keyed by job id, and the descriptor history appended when a
//! job finishes. All writes go through the caller's transaction so a state
//! transition and its version bump commit atomically.

use kestrel_common::error::{DdlError, DdlResult};
use kestrel_common::schema::TableInfo;
use kestrel_common::types::{Handle, SchemaId, TableId};
use kestrel_kv::{run_in_new_txn, KvStore, Transaction};

use serde::{Deserialize, Serialize};

const SCHEMA_VERSION_KEY: &[u8] = b"m:schema_version";

fn table_key(schema_id: SchemaId, table_id: TableId) -> Vec<u8> {
    format!("m:tbl:{}:{}", schema_id, table_id).into_bytes()
}

fn reorg_key(job_id: i64) -> Vec<u8> {
    format!("m:reorg:{}", job_id).into_bytes()
}

fn history_key(job_id: i64) -> Vec<u8> {
    format!("m:history:{}", job_id).into_bytes()
}

fn meta_err(e: impl std::fmt::Display) -> DdlError {
    DdlError::Meta(e.to_string())
}

/// Descriptor snapshot recorded when a DDL job finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: i64,
    pub table: TableInfo,
}

/// Read a table descriptor at the store's current version.
pub fn get_table(
    store: &dyn KvStore,
    schema_id: SchemaId,
    table_id: TableId,
) -> DdlResult<Option<TableInfo>> {
    let snap = store.get_snapshot(store.current_version())?;
    match snap.get(&table_key(schema_id, table_id)) {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(meta_err)?)),
        None => Ok(None),
    }
}

/// Persist a table descriptor.
pub fn update_table(
    txn: &mut dyn Transaction,
    schema_id: SchemaId,
    tbl: &TableInfo,
) -> DdlResult<()> {
    let bytes = serde_json::to_vec(tbl).map_err(meta_err)?;
    txn.set(&table_key(schema_id, tbl.id), bytes);
    Ok(())
}

/// Bump the global schema version and return the new value. Peers watch
/// this counter to invalidate cached descriptors.
pub fn update_schema_version(txn: &mut dyn Transaction) -> DdlResult<i64> {
    let cur = match txn.get(SCHEMA_VERSION_KEY) {
        Some(bytes) => serde_json::from_slice::<i64>(&bytes).map_err(meta_err)?,
        None => 0,
    };
    let next = cur + 1;
    txn.set(
        SCHEMA_VERSION_KEY,
        serde_json::to_vec(&next).map_err(meta_err)?,
    );
    Ok(next)
}

/// Current schema version (0 before any DDL ran).
pub fn schema_version(store: &dyn KvStore) -> DdlResult<i64> {
    let snap = store.get_snapshot(store.current_version())?;
    match snap.get(SCHEMA_VERSION_KEY) {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(meta_err),
        None => Ok(0),
    }
}

/// Next handle the backfill of `job_id` should process; 0 when the job has
/// never checkpointed.
pub fn get_reorg_handle(store: &dyn KvStore, job_id: i64) -> DdlResult<Handle> {
    let snap = store.get_snapshot(store.current_version())?;
    match snap.get(&reorg_key(job_id)) {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(meta_err),
        None => Ok(0),
    }
}

/// Persist the backfill checkpoint of `job_id`.
pub fn update_reorg_handle(
    txn: &mut dyn Transaction,
    job_id: i64,
    handle: Handle,
) -> DdlResult<()> {
    txn.set(&reorg_key(job_id), serde_json::to_vec(&handle).map_err(meta_err)?);
    Ok(())
}

/// Drop the checkpoint once the job is done.
pub fn remove_reorg_handle(txn: &mut dyn Transaction, job_id: i64) {
    txn.delete(&reorg_key(job_id));
}

/// Append the finished descriptor to the job's history.
pub fn add_history(
    txn: &mut dyn Transaction,
    job_id: i64,
    version: i64,
    tbl: &TableInfo,
) -> DdlResult<()> {
    let entry = HistoryEntry {
        version,
        table: tbl.clone(),
    };
    txn.set(
        &history_key(job_id),
        serde_json::to_vec(&entry).map_err(meta_err)?,
    );
    Ok(())
}

pub fn get_history(store: &dyn KvStore, job_id: i64) -> DdlResult<Option<HistoryEntry>> {
    let snap = store.get_snapshot(store.current_version())?;
    match snap.get(&history_key(job_id)) {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(meta_err)?)),
        None => Ok(None),
    }
}

/// Bootstrap helper: persist a new table descriptor in its own
/// transaction, bumping the schema version.
pub fn create_table(store: &dyn KvStore, schema_id: SchemaId, tbl: &TableInfo) -> DdlResult<()> {
    run_in_new_txn(store, true, |txn| {
        update_schema_version(txn)?;
        update_table(txn, schema_id, tbl)
    })
}
