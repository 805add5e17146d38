//! Index descriptor construction and the create/drop state machines.
//!
//! The create path walks `None → DeleteOnly → WriteOnly →
//! WriteReorganization → Public`, the drop path `Public → WriteOnly →
//! DeleteOnly → DeleteReorganization → absent`. The order is deliberately
//! reversed: a newly appearing write-only index must be invisible to
//! readers but maintained by writers, so replicas that still consider it
//! public downgrade first; a disappearing index must keep being
//! deleted-on-delete by laggard replicas until no one reads it any more.

use std::collections::HashSet;

use kestrel_common::error::{DdlError, DdlResult};
use kestrel_common::job::{DdlJob, DropIndexArgs, IndexColSpec, JobState};
use kestrel_common::schema::{IndexColumn, IndexInfo, IndexState, TableInfo};
use kestrel_common::types::{CiName, IndexId, MULTIPLE_KEY_FLAG, UNIQUE_KEY_FLAG};
use kestrel_kv::{run_in_new_txn, KvStore};

use crate::meta;
use crate::reorg;
use crate::table::Table;
use crate::DdlEngine;

/// Longest accepted prefix length for a key column.
pub const MAX_PREFIX_LENGTH: usize = 767;

/// Validate column references and produce an index descriptor pinned in
/// state [`IndexState::None`]. The id is assigned by the caller.
pub fn build_index_info(
    tbl: &TableInfo,
    unique: bool,
    index_name: &str,
    idx_cols: &[IndexColSpec],
) -> DdlResult<IndexInfo> {
    let mut columns = Vec::with_capacity(idx_cols.len());
    let mut seen: HashSet<String> = HashSet::with_capacity(idx_cols.len());
    for spec in idx_cols {
        let col = tbl
            .find_column(&spec.name)
            .ok_or_else(|| DdlError::KeyColumnDoesNotExist {
                column: spec.name.clone(),
            })?;

        // Length must be specified for BLOB and TEXT column indexes.
        if col.kind.is_blob() && spec.length.is_none() {
            return Err(DdlError::BlobKeyWithoutLength);
        }

        if spec.length.is_some() && !col.kind.is_character() && !col.kind.is_blob() {
            return Err(DdlError::IncorrectPrefixKey);
        }

        if let Some(length) = spec.length {
            if length > MAX_PREFIX_LENGTH {
                return Err(DdlError::TooLongKey {
                    length,
                    max: MAX_PREFIX_LENGTH,
                });
            }
        }

        if !seen.insert(col.name.lowered.clone()) {
            return Err(DdlError::DupColumnName {
                column: spec.name.clone(),
            });
        }

        columns.push(IndexColumn {
            name: col.name.clone(),
            offset: col.offset,
            length: spec.length,
        });
    }

    Ok(IndexInfo {
        id: IndexId(0),
        name: CiName::new(index_name),
        columns,
        unique,
        state: IndexState::None,
    })
}

/// Set the advisory flag on the index's leading column: `UNIQUE_KEY_FLAG`
/// for a single-column unique index, `MULTIPLE_KEY_FLAG` otherwise.
pub fn add_index_column_flag(tbl: &mut TableInfo, index: &IndexInfo) {
    let offset = index.columns[0].offset;
    if index.unique && index.columns.len() == 1 {
        tbl.columns[offset].set_flag(UNIQUE_KEY_FLAG);
    } else {
        tbl.columns[offset].set_flag(MULTIPLE_KEY_FLAG);
    }
}

/// Clear the flag `index` contributed, then re-apply flags for every other
/// index led by the same column.
pub fn drop_index_column_flag(tbl: &mut TableInfo, index: &IndexInfo) {
    let offset = index.columns[0].offset;
    if index.unique && index.columns.len() == 1 {
        tbl.columns[offset].clear_flag(UNIQUE_KEY_FLAG);
    } else {
        tbl.columns[offset].clear_flag(MULTIPLE_KEY_FLAG);
    }

    // Other indexes may still cover this column.
    let col_name = tbl.columns[offset].name.clone();
    let covering: Vec<IndexInfo> = tbl
        .indices
        .iter()
        .filter(|other| other.name != index.name && other.columns[0].name == col_name)
        .cloned()
        .collect();
    for other in &covering {
        add_index_column_flag(tbl, other);
    }
}

impl<S: KvStore + 'static> DdlEngine<S> {
    /// Advance a CREATE INDEX job by one state.
    ///
    /// Contract: the external owner loop re-invokes until the job is
    /// terminal. During `WriteReorganization` an invocation may return
    /// `Ok` *without* advancing: first when it has only pinned the
    /// snapshot version into the job (which the loop must persist before
    /// re-invoking), and again whenever the backfill wait times out.
    pub fn on_create_index(&self, job: &mut DdlJob) -> DdlResult<()> {
        // A rollback job tears down exactly like a drop.
        if job.state == JobState::Rollback {
            return self.on_drop_index(job);
        }

        let mut tbl = self.load_table(job)?;
        let args = match job.decode_create_index_args() {
            Ok(args) => args,
            Err(e) => {
                job.state = JobState::Cancelled;
                return Err(e);
            }
        };

        let lowered = args.name.to_lowercase();
        let existing = tbl.indices.iter().position(|i| i.name.lowered == lowered);
        if let Some(pos) = existing {
            if tbl.indices[pos].state == IndexState::Public {
                job.state = JobState::Cancelled;
                return Err(DdlError::DupKeyName { name: args.name });
            }
        }
        let pos = match existing {
            Some(pos) => pos,
            None => {
                let mut info =
                    match build_index_info(&tbl, args.unique, &args.name, &args.columns) {
                        Ok(info) => info,
                        Err(e) => {
                            job.state = JobState::Cancelled;
                            return Err(e);
                        }
                    };
                info.id = tbl.allocate_index_id();
                tbl.indices.push(info);
                tbl.indices.len() - 1
            }
        };

        match tbl.indices[pos].state {
            IndexState::None => {
                // none -> delete only
                job.schema_state = IndexState::DeleteOnly;
                tbl.indices[pos].state = IndexState::DeleteOnly;
                self.persist_table(job, &tbl)?;
                Ok(())
            }
            IndexState::DeleteOnly => {
                // delete only -> write only
                job.schema_state = IndexState::WriteOnly;
                tbl.indices[pos].state = IndexState::WriteOnly;
                self.persist_table(job, &tbl)?;
                Ok(())
            }
            IndexState::WriteOnly => {
                // write only -> reorganization
                job.schema_state = IndexState::WriteReorganization;
                tbl.indices[pos].state = IndexState::WriteReorganization;
                // Reset so the reorganization pins a fresh snapshot version.
                job.snapshot_ver = 0;
                self.persist_table(job, &tbl)?;
                Ok(())
            }
            IndexState::WriteReorganization => {
                // reorganization -> public
                let reorg_info = self.get_reorg_info(job)?;
                if reorg_info.first {
                    // Snapshot version just pinned; the owner loop persists
                    // the job, then the next invocation runs the scan.
                    return Ok(());
                }

                let index_info = tbl.indices[pos].clone();
                let res = {
                    let store = self.store.clone();
                    let ctx = self.ctx.clone();
                    let cfg = self.cfg.clone();
                    let table = Table::new(tbl.clone());
                    let scan_index = index_info.clone();
                    let job_id = job.id;
                    self.ctx.run_reorg_job(
                        job,
                        self.cfg.reorg_wait_timeout(),
                        move |progress| {
                            reorg::add_table_index(
                                store.as_ref(),
                                &ctx,
                                &cfg,
                                &table,
                                &scan_index,
                                reorg_info.handle,
                                job_id,
                                &progress,
                            )
                        },
                    )
                };
                match res {
                    Ok(()) => {}
                    Err(DdlError::WaitReorgTimeout) => {
                        // Check ownership and re-wait on the next invocation.
                        tracing::info!(job_id = job.id, "backfill still running, will re-wait");
                        return Ok(());
                    }
                    Err(e) if e.is_key_exists() => {
                        tracing::warn!(
                            job_id = job.id,
                            index = %index_info.name,
                            error = %e,
                            "backfill hit duplicate key, converting to rollback job"
                        );
                        return self.convert_to_rollback_job(job, &mut tbl, pos, e);
                    }
                    Err(e) => return Err(e),
                }

                tbl.indices[pos].state = IndexState::Public;
                let index_info = tbl.indices[pos].clone();
                add_index_column_flag(&mut tbl, &index_info);
                self.finish_job(job, &tbl)?;

                job.schema_state = IndexState::Public;
                job.state = JobState::Done;
                tracing::info!(
                    job_id = job.id,
                    index = %index_info.name,
                    rows = job.row_count,
                    "index is public"
                );
                Ok(())
            }
            state => Err(DdlError::InvalidIndexState(state)),
        }
    }

    /// Flip a create job whose backfill found a duplicate key into a
    /// rollback job and hand the descriptor to the drop state machine.
    ///
    /// `WriteReorganization` on the create path corresponds to `WriteOnly`
    /// on the drop path, so the descriptor steps back to `DeleteOnly`; the
    /// drop machine then tears down everything the backfill wrote. The
    /// duplicate-key error is re-raised for the owner loop.
    fn convert_to_rollback_job(
        &self,
        job: &mut DdlJob,
        tbl: &mut TableInfo,
        pos: usize,
        dup_err: DdlError,
    ) -> DdlResult<()> {
        job.state = JobState::Rollback;
        job.args = serde_json::to_value(DropIndexArgs {
            name: tbl.indices[pos].name.origin.clone(),
        })
        .map_err(|e| DdlError::Meta(e.to_string()))?;
        tbl.indices[pos].state = IndexState::DeleteOnly;
        job.schema_state = IndexState::DeleteOnly;
        self.persist_table(job, tbl)?;
        Err(dup_err)
    }

    /// Advance a DROP INDEX job (or the teardown of a rollback job) by one
    /// state.
    pub fn on_drop_index(&self, job: &mut DdlJob) -> DdlResult<()> {
        let mut tbl = self.load_table(job)?;
        let args = match job.decode_drop_index_args() {
            Ok(args) => args,
            Err(e) => {
                job.state = JobState::Cancelled;
                return Err(e);
            }
        };

        let lowered = args.name.to_lowercase();
        let pos = match tbl.indices.iter().position(|i| i.name.lowered == lowered) {
            Some(pos) => pos,
            None => {
                job.state = JobState::Cancelled;
                return Err(DdlError::CantDropFieldOrKey { name: args.name });
            }
        };

        match tbl.indices[pos].state {
            IndexState::Public => {
                // public -> write only
                job.schema_state = IndexState::WriteOnly;
                tbl.indices[pos].state = IndexState::WriteOnly;
                self.persist_table(job, &tbl)?;
                Ok(())
            }
            IndexState::WriteOnly => {
                // write only -> delete only
                job.schema_state = IndexState::DeleteOnly;
                tbl.indices[pos].state = IndexState::DeleteOnly;
                self.persist_table(job, &tbl)?;
                Ok(())
            }
            IndexState::DeleteOnly => {
                // delete only -> reorganization
                job.schema_state = IndexState::DeleteReorganization;
                tbl.indices[pos].state = IndexState::DeleteReorganization;
                self.persist_table(job, &tbl)?;
                Ok(())
            }
            IndexState::DeleteReorganization => {
                // reorganization -> absent
                let index_id = tbl.indices[pos].id;
                let res = {
                    let store = self.store.clone();
                    let ctx = self.ctx.clone();
                    let cfg = self.cfg.clone();
                    let table_id = tbl.id;
                    self.ctx
                        .run_reorg_job(job, self.cfg.reorg_wait_timeout(), move |_progress| {
                            reorg::drop_table_index(store.as_ref(), &ctx, &cfg, table_id, index_id)
                        })
                };
                match res {
                    Ok(()) => {}
                    Err(DdlError::WaitReorgTimeout) => {
                        tracing::info!(job_id = job.id, "bulk delete still running, will re-wait");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }

                // All reorganization work is done; drop the descriptor.
                let removed = tbl.indices.remove(pos);
                drop_index_column_flag(&mut tbl, &removed);
                self.finish_job(job, &tbl)?;

                job.schema_state = IndexState::None;
                job.state = if job.state == JobState::Rollback {
                    JobState::RollbackDone
                } else {
                    JobState::Done
                };
                tracing::info!(
                    job_id = job.id,
                    index = %removed.name,
                    "index dropped"
                );
                Ok(())
            }
            IndexState::None | IndexState::WriteReorganization => Err(DdlError::InvalidTableState),
        }
    }

    // ── shared steps ─────────────────────────────────────────────────

    fn load_table(&self, job: &mut DdlJob) -> DdlResult<TableInfo> {
        match meta::get_table(self.store.as_ref(), job.schema_id, job.table_id)? {
            Some(tbl) => Ok(tbl),
            None => {
                job.state = JobState::Cancelled;
                Err(DdlError::TableNotFound)
            }
        }
    }

    /// Commit one state transition: bump the schema version and write the
    /// descriptor in a single transaction.
    fn persist_table(&self, job: &DdlJob, tbl: &TableInfo) -> DdlResult<i64> {
        run_in_new_txn(self.store.as_ref(), true, |txn| {
            let ver = meta::update_schema_version(txn)?;
            meta::update_table(txn, job.schema_id, tbl)?;
            Ok(ver)
        })
    }

    /// Final commit of a finished job: descriptor, history entry, and
    /// checkpoint cleanup, atomically.
    fn finish_job(&self, job: &DdlJob, tbl: &TableInfo) -> DdlResult<i64> {
        run_in_new_txn(self.store.as_ref(), true, |txn| {
            let ver = meta::update_schema_version(txn)?;
            meta::update_table(txn, job.schema_id, tbl)?;
            meta::add_history(txn, job.id, ver, tbl)?;
            meta::remove_reorg_handle(txn, job.id);
            Ok(ver)
        })
    }

    /// Load the reorganization checkpoint. On the first invocation of a
    /// reorganization (`job.snapshot_ver == 0`) this pins the current
    /// store version into the job and reports `first = true`; the caller
    /// returns without scanning so the version is durably recorded by the
    /// owner loop before any backfill runs against it.
    fn get_reorg_info(&self, job: &mut DdlJob) -> DdlResult<reorg::ReorgInfo> {
        let first = job.snapshot_ver == 0;
        if first {
            job.snapshot_ver = self.store.current_version();
        }
        let handle = meta::get_reorg_handle(self.store.as_ref(), job.id)?;
        Ok(reorg::ReorgInfo { handle, first })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::schema::ColumnInfo;
    use kestrel_common::types::{ColumnKind, TableId};

    fn spec(name: &str, length: Option<usize>) -> IndexColSpec {
        IndexColSpec {
            name: name.into(),
            length,
        }
    }

    fn test_table() -> TableInfo {
        TableInfo {
            id: TableId(1),
            name: CiName::new("t"),
            columns: vec![
                ColumnInfo {
                    id: 1,
                    name: CiName::new("id"),
                    offset: 0,
                    kind: ColumnKind::Int,
                    flags: 0,
                },
                ColumnInfo {
                    id: 2,
                    name: CiName::new("name"),
                    offset: 1,
                    kind: ColumnKind::VarChar,
                    flags: 0,
                },
                ColumnInfo {
                    id: 3,
                    name: CiName::new("bio"),
                    offset: 2,
                    kind: ColumnKind::Text,
                    flags: 0,
                },
            ],
            indices: vec![],
            max_index_id: 0,
        }
    }

    #[test]
    fn test_build_rejects_missing_column() {
        let tbl = test_table();
        let err = build_index_info(&tbl, false, "k", &[spec("ghost", None)]).unwrap_err();
        assert!(matches!(err, DdlError::KeyColumnDoesNotExist { column } if column == "ghost"));
    }

    #[test]
    fn test_build_rejects_blob_without_length() {
        let tbl = test_table();
        let err = build_index_info(&tbl, false, "k", &[spec("bio", None)]).unwrap_err();
        assert!(matches!(err, DdlError::BlobKeyWithoutLength));
    }

    #[test]
    fn test_build_rejects_length_on_non_string() {
        let tbl = test_table();
        let err = build_index_info(&tbl, false, "k", &[spec("id", Some(10))]).unwrap_err();
        assert!(matches!(err, DdlError::IncorrectPrefixKey));
    }

    #[test]
    fn test_build_prefix_length_boundary() {
        let tbl = test_table();
        // 767 is the last accepted length; 768 is rejected.
        assert!(build_index_info(&tbl, false, "k", &[spec("name", Some(767))]).is_ok());
        let err = build_index_info(&tbl, false, "k", &[spec("name", Some(768))]).unwrap_err();
        assert!(matches!(
            err,
            DdlError::TooLongKey {
                length: 768,
                max: 767
            }
        ));
    }

    #[test]
    fn test_build_rejects_duplicate_column() {
        let tbl = test_table();
        let err =
            build_index_info(&tbl, false, "k", &[spec("name", None), spec("NAME", None)])
                .unwrap_err();
        assert!(matches!(err, DdlError::DupColumnName { .. }));
    }

    #[test]
    fn test_build_pins_state_none_and_offsets() {
        let tbl = test_table();
        let info =
            build_index_info(&tbl, true, "k", &[spec("name", Some(10)), spec("id", None)])
                .unwrap();
        assert_eq!(info.state, IndexState::None);
        assert!(info.unique);
        assert_eq!(info.columns[0].offset, 1);
        assert_eq!(info.columns[0].length, Some(10));
        assert_eq!(info.columns[1].offset, 0);
        assert_eq!(info.columns[1].length, None);
    }

    fn public_index(tbl: &mut TableInfo, name: &str, cols: &[&str], unique: bool) -> IndexInfo {
        let specs: Vec<IndexColSpec> = cols.iter().map(|c| spec(c, None)).collect();
        let mut info = build_index_info(tbl, unique, name, &specs).unwrap();
        info.id = tbl.allocate_index_id();
        info.state = IndexState::Public;
        tbl.indices.push(info.clone());
        info
    }

    #[test]
    fn test_flags_single_column_unique() {
        let mut tbl = test_table();
        let idx = public_index(&mut tbl, "uk", &["name"], true);
        add_index_column_flag(&mut tbl, &idx);
        assert!(tbl.columns[1].is_unique_key());
        assert!(!tbl.columns[1].is_multiple_key());
    }

    #[test]
    fn test_flags_multi_column_unique_is_multiple_key() {
        let mut tbl = test_table();
        let idx = public_index(&mut tbl, "uk", &["name", "id"], true);
        add_index_column_flag(&mut tbl, &idx);
        assert!(!tbl.columns[1].is_unique_key());
        assert!(tbl.columns[1].is_multiple_key());
    }

    #[test]
    fn test_drop_flag_restores_covering_index() {
        let mut tbl = test_table();
        let uk = public_index(&mut tbl, "uk", &["name"], true);
        add_index_column_flag(&mut tbl, &uk);
        let mk = public_index(&mut tbl, "mk", &["name", "id"], false);
        add_index_column_flag(&mut tbl, &mk);
        assert!(tbl.columns[1].is_unique_key());
        assert!(tbl.columns[1].is_multiple_key());

        // Dropping the unique index clears its flag but keeps the
        // multiple-key flag contributed by the surviving index.
        tbl.indices.retain(|i| i.name.lowered != "uk");
        drop_index_column_flag(&mut tbl, &uk);
        assert!(!tbl.columns[1].is_unique_key());
        assert!(tbl.columns[1].is_multiple_key());
    }

    #[test]
    fn test_drop_flag_roundtrip_restores_pristine_state() {
        let mut tbl = test_table();
        let before = tbl.columns.clone();
        let idx = public_index(&mut tbl, "uk", &["name"], true);
        add_index_column_flag(&mut tbl, &idx);
        tbl.indices.retain(|i| i.name.lowered != "uk");
        drop_index_column_flag(&mut tbl, &idx);
        assert_eq!(tbl.columns, before);
    }
}
