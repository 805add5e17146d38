//! Reorganization: snapshot scans, the concurrent backfill pipeline, and
//! bulk index deletion.
//!
//! The dispatcher partitions the handle space into fixed-size batches and
//! fans out up to `batch_count` workers per round. Workers start in
//! ascending handle order (worker *k+1* is not launched until worker *k*
//! has published the last handle of its batch on a single-slot channel)
//! but may commit in any order; the dispatcher sorts results before
//! persisting the checkpoint. Each worker publishes its batch boundary
//! exactly once, so internal transaction retries cannot shift batch
//! boundaries and make two workers race on the same rows.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kestrel_common::datum::Datum;
use kestrel_common::error::{DdlError, DdlResult, KvError};
use kestrel_common::job::DdlJob;
use kestrel_common::schema::IndexInfo;
use kestrel_common::types::{ColumnKind, Handle, IndexId, TableId};
use kestrel_kv::{codec, run_in_new_txn, KvStore, Transaction};

use crate::meta;
use crate::table::{Table, TableIndex};
use crate::DdlConfig;

/// Backfill progress for one reorganization, shared between the handler
/// and the background task across wait timeouts.
pub struct ReorgProgress {
    rows: AtomicI64,
}

impl ReorgProgress {
    pub fn new(initial: i64) -> Self {
        Self {
            rows: AtomicI64::new(initial),
        }
    }

    pub fn add(&self, n: i64) {
        self.rows.fetch_add(n, Ordering::SeqCst);
    }

    pub fn rows(&self) -> i64 {
        self.rows.load(Ordering::SeqCst)
    }
}

/// Reorganization checkpoint as seen by a handler invocation.
#[derive(Debug, Clone, Copy)]
pub struct ReorgInfo {
    /// Next handle to process.
    pub handle: Handle,
    /// True only on the first invocation of this reorganization: the
    /// snapshot version has just been pinned into the job and the handler
    /// must return without scanning so the job is persisted first.
    pub first: bool,
}

struct RunningReorg {
    job_id: i64,
    rx: Receiver<DdlResult<()>>,
    progress: Arc<ReorgProgress>,
}

/// Owner-side control state for reorganizations.
pub struct ReorgContext {
    owner: AtomicBool,
    job_cancelled: AtomicBool,
    running: Mutex<Option<RunningReorg>>,
}

impl ReorgContext {
    pub fn new() -> Self {
        Self {
            owner: AtomicBool::new(true),
            job_cancelled: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    pub fn set_owner(&self, owner: bool) {
        self.owner.store(owner, Ordering::SeqCst);
    }

    pub fn is_owner(&self) -> bool {
        self.owner.load(Ordering::SeqCst)
    }

    pub fn set_job_cancelled(&self, cancelled: bool) {
        self.job_cancelled.store(cancelled, Ordering::SeqCst);
    }

    /// Checked by every worker at transaction start.
    pub fn is_reorg_runnable(&self) -> DdlResult<()> {
        if !self.owner.load(Ordering::SeqCst) {
            return Err(DdlError::NotOwner);
        }
        if self.job_cancelled.load(Ordering::SeqCst) {
            return Err(DdlError::JobCancelled);
        }
        Ok(())
    }

    /// Run `f` on a background thread, waiting up to `timeout`.
    ///
    /// At most one reorganization task runs per job: a handler invocation
    /// that arrives while the task is still running (after an earlier
    /// `WaitReorgTimeout`) re-attaches to it and discards `f`. On timeout
    /// the task keeps running and the caller returns without advancing
    /// state; `job.row_count` is refreshed from the shared progress on
    /// every path.
    pub fn run_reorg_job<F>(&self, job: &mut DdlJob, timeout: Duration, f: F) -> DdlResult<()>
    where
        F: FnOnce(Arc<ReorgProgress>) -> DdlResult<()> + Send + 'static,
    {
        let mut running = self.running.lock();
        let attached = matches!(running.as_ref(), Some(r) if r.job_id == job.id);
        if !attached {
            let progress = Arc::new(ReorgProgress::new(job.row_count));
            let (tx, rx) = mpsc::sync_channel(1);
            let task_progress = progress.clone();
            std::thread::Builder::new()
                .name(format!("kestrel-reorg-{}", job.id))
                .spawn(move || {
                    let _ = tx.send(f(task_progress));
                })
                .map_err(|e| DdlError::Meta(format!("spawn reorg thread: {e}")))?;
            *running = Some(RunningReorg {
                job_id: job.id,
                rx,
                progress,
            });
        }

        let res = {
            let entry = running.as_ref().expect("reorg task present");
            let res = entry.rx.recv_timeout(timeout);
            job.row_count = entry.progress.rows();
            res
        };
        match res {
            Ok(inner) => {
                *running = None;
                inner
            }
            Err(RecvTimeoutError::Timeout) => Err(DdlError::WaitReorgTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                *running = None;
                Err(DdlError::Meta("reorganization task aborted".into()))
            }
        }
    }
}

impl Default for ReorgContext {
    fn default() -> Self {
        Self::new()
    }
}

// ── snapshot row iteration ───────────────────────────────────────────

/// Stream rows of `table` from the snapshot at `version`, starting at
/// `seek_handle`. Invokes `f(handle, row_key, raw_row)` per row; iteration
/// stops when `f` returns `Ok(false)` or an error. After each row the
/// iterator advances past every key sharing the row's key prefix
/// (column-family keys); end-of-range from that advance ends iteration.
pub fn iterate_snapshot_rows(
    store: &dyn KvStore,
    table: &Table,
    version: u64,
    seek_handle: Handle,
    f: &mut dyn FnMut(Handle, Vec<u8>, &[u8]) -> DdlResult<bool>,
) -> DdlResult<()> {
    let snap = store.get_snapshot(version).map_err(DdlError::from)?;
    let first_key = table.record_key(seek_handle);
    let mut it = snap.seek(&first_key);

    while it.valid() {
        if !it.key().starts_with(table.record_prefix()) {
            break;
        }
        let handle = codec::decode_row_key(it.key())?;
        let row_key = table.record_key(handle);

        let more = f(handle, row_key.clone(), it.value())?;
        if !more {
            return Ok(());
        }

        match it.next_until(&row_key) {
            Ok(()) => {}
            Err(KvError::NotExist) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// ── batch bookkeeping ────────────────────────────────────────────────

/// True when `handle` has reached the batch's upper bound `limit`.
/// A `limit` of 0 means "no upper bound", not "stop immediately".
fn reached_end(limit: Handle, handle: Handle) -> bool {
    limit != 0 && handle >= limit
}

/// Result of one batch worker.
#[derive(Debug, Default, Clone)]
struct BatchRet {
    count: usize,
    /// Last handle this batch processed; 0 if the batch was empty.
    done_handle: Handle,
    err: Option<DdlError>,
}

/// Per-worker handle range. `end_handle` is latched by the first
/// publication and bounds every re-fetch, so a transaction retry replays
/// exactly the same handle range.
struct HandleInfo {
    start_handle: Handle,
    end_handle: Handle,
    published: bool,
}

impl HandleInfo {
    fn new(start_handle: Handle) -> Self {
        Self {
            start_handle,
            end_handle: 0,
            published: false,
        }
    }

    /// One-shot publication of this worker's boundary on the dispatcher's
    /// next-handle channel. Returns whether this call published.
    fn publish_once(&mut self, next_tx: &SyncSender<Handle>, handle: Handle) -> bool {
        if self.published {
            return false;
        }
        self.published = true;
        let _ = next_tx.send(handle);
        true
    }
}

struct BatchOpInfo<'a> {
    index: &'a TableIndex,
    table: &'a Table,
    col_map: &'a BTreeMap<i64, ColumnKind>,
    next_tx: &'a SyncSender<Handle>,
    ret_tx: &'a SyncSender<BatchRet>,
    batch_size: usize,
}

struct IndexRecord {
    handle: Handle,
    key: Vec<u8>,
    vals: Vec<Datum>,
}

/// Read one batch of raw rows from the worker transaction's snapshot and
/// decode the indexed column values.
fn fetch_row_col_vals(
    store: &dyn KvStore,
    txn: &dyn Transaction,
    op: &BatchOpInfo<'_>,
    hinfo: &mut HandleInfo,
) -> (Vec<IndexRecord>, BatchRet) {
    let mut ret = BatchRet::default();
    let mut raw_rows: Vec<Vec<u8>> = Vec::with_capacity(op.batch_size);
    let mut records: Vec<IndexRecord> = Vec::with_capacity(op.batch_size);

    let res = iterate_snapshot_rows(
        store,
        op.table,
        txn.start_ts(),
        hinfo.start_handle,
        &mut |handle, row_key, raw_row| {
            raw_rows.push(raw_row.to_vec());
            records.push(IndexRecord {
                handle,
                key: row_key,
                vals: Vec::new(),
            });
            if records.len() == op.batch_size || reached_end(hinfo.end_handle, handle) {
                return Ok(false);
            }
            Ok(true)
        },
    );
    if let Err(e) = res {
        ret.err = Some(e);
        return (Vec::new(), ret);
    }

    ret.count = records.len();
    if ret.count > 0 {
        ret.done_handle = records[ret.count - 1].handle;
    }
    // Hand the boundary to the dispatcher exactly once, and pin this
    // worker's range so a transaction retry cannot grow the batch.
    if hinfo.publish_once(op.next_tx, ret.done_handle) {
        hinfo.end_handle = ret.done_handle;
    }
    if ret.count == 0 {
        return (Vec::new(), ret);
    }

    for (i, record) in records.iter_mut().enumerate() {
        let row = match codec::decode_row(&raw_rows[i], op.col_map) {
            Ok(r) => r,
            Err(e) => {
                ret.err = Some(e.into());
                return (Vec::new(), ret);
            }
        };
        let mut vals = Vec::with_capacity(op.index.meta().columns.len());
        for ic in &op.index.meta().columns {
            let col = &op.table.cols()[ic.offset];
            vals.push(row.get(&col.id).cloned().unwrap_or(Datum::Null));
        }
        record.vals = vals;
    }
    (records, ret)
}

/// Backfill one batch inside `txn`: lock each base row, then write its
/// index entry. A duplicate reporting the record's own handle means a
/// concurrent write-only DML raced ahead of the scan; skip it.
fn backfill_index_in_txn(
    store: &dyn KvStore,
    txn: &mut dyn Transaction,
    op: &BatchOpInfo<'_>,
    hinfo: &mut HandleInfo,
) -> BatchRet {
    let (records, mut ret) = fetch_row_col_vals(store, txn, op, hinfo);
    if ret.err.is_some() {
        return ret;
    }

    for record in &records {
        tracing::debug!(handle = record.handle, "backfilling index entry");
        if let Err(e) = txn.lock_keys(&[&record.key]) {
            ret.err = Some(e.into());
            return ret;
        }
        match op.index.create(txn, &record.vals, record.handle) {
            Ok(()) => {}
            Err(KvError::KeyExists { handle }) if handle == record.handle => continue,
            Err(e) => {
                ret.err = Some(e.into());
                return ret;
            }
        }
    }
    ret
}

/// One batch worker: runs `backfill_index_in_txn` in a fresh retryable
/// transaction and reports its result. If the batch failed before its
/// boundary was published, publish the start handle so the dispatcher is
/// never left waiting.
fn backfill_batch(
    store: &dyn KvStore,
    ctx: &ReorgContext,
    op: &BatchOpInfo<'_>,
    start_handle: Handle,
) {
    let mut hinfo = HandleInfo::new(start_handle);
    let mut final_ret = BatchRet::default();

    let res: DdlResult<()> = run_in_new_txn(store, true, |txn| {
        ctx.is_reorg_runnable()?;
        let ret = backfill_index_in_txn(store, txn, op, &mut hinfo);
        let err = ret.err.clone();
        final_ret = ret;
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });
    if let Err(e) = res {
        final_ret.err = Some(e);
    }

    if final_ret.count == 0 && final_ret.err.is_some() {
        hinfo.publish_once(op.next_tx, start_handle);
    }
    let _ = op.ret_tx.send(final_ret);
}

/// Merge a round's results: sort by `done_handle`, then accumulate counts
/// up to the first error. Returns `(rows added, max contiguous done
/// handle, first error)`.
fn collect_results(rets: &mut [BatchRet]) -> (i64, Handle, Option<DdlError>) {
    rets.sort_by_key(|r| r.done_handle);
    let mut added: i64 = 0;
    let mut done_handle: Handle = 0;
    let mut err = None;
    for ret in rets.iter() {
        if let Some(e) = &ret.err {
            err = Some(e.clone());
            break;
        }
        added += ret.count as i64;
        done_handle = ret.done_handle;
    }
    (added, done_handle, err)
}

// ── backfill dispatcher ──────────────────────────────────────────────

/// Populate `index_info` with entries for every row of `table`, resuming
/// from `start_handle`. Runs rounds of up to `cfg.batch_count` parallel
/// batch workers until a round comes up short of workers, checkpointing
/// the processed-handle watermark after every round.
pub fn add_table_index(
    store: &dyn KvStore,
    ctx: &ReorgContext,
    cfg: &DdlConfig,
    table: &Table,
    index_info: &IndexInfo,
    start_handle: Handle,
    job_id: i64,
    progress: &ReorgProgress,
) -> DdlResult<()> {
    let index = TableIndex::new(table.meta().id, index_info.clone());
    let mut col_map: BTreeMap<i64, ColumnKind> = BTreeMap::new();
    for ic in &index_info.columns {
        let col = &table.cols()[ic.offset];
        col_map.insert(col.id, col.kind);
    }

    let (next_tx, next_rx) = mpsc::sync_channel::<Handle>(1);
    let (ret_tx, ret_rx) = mpsc::sync_channel::<BatchRet>(cfg.batch_count);
    let op = BatchOpInfo {
        index: &index,
        table,
        col_map: &col_map,
        next_tx: &next_tx,
        ret_tx: &ret_tx,
        batch_size: cfg.batch_size,
    };

    let mut seek_handle = start_handle;
    loop {
        let started = Instant::now();
        let mut launched = 0usize;

        std::thread::scope(|s| -> DdlResult<()> {
            for _ in 0..cfg.batch_count {
                let worker_start = seek_handle;
                let op_ref = &op;
                std::thread::Builder::new()
                    .name("kestrel-backfill".into())
                    .spawn_scoped(s, move || backfill_batch(store, ctx, op_ref, worker_start))
                    .map_err(|e| DdlError::Meta(format!("spawn backfill worker: {e}")))?;
                launched += 1;

                let handle = next_rx
                    .recv()
                    .map_err(|_| DdlError::Meta("next-handle channel closed".into()))?;
                if handle == 0 {
                    // No more data; stop launching this round.
                    break;
                }
                seek_handle = handle + 1;
            }
            Ok(())
        })?;

        // The scope joined every worker, so each launched batch has
        // pushed exactly one result; drain them all in one go.
        let mut rets: Vec<BatchRet> = Vec::with_capacity(launched);
        while let Ok(ret) = ret_rx.try_recv() {
            rets.push(ret);
        }
        let ret_cnt = rets.len();
        let (added, done_handle, mut err) = collect_results(&mut rets);

        if added != 0 {
            let checkpoint = done_handle + 1;
            let persisted: DdlResult<()> = run_in_new_txn(store, true, |txn| {
                meta::update_reorg_handle(txn, job_id, checkpoint)
            });
            if let Err(persist_err) = persisted {
                if err.is_none() {
                    err = Some(persist_err);
                } else {
                    tracing::warn!(
                        job_id,
                        handle = done_handle,
                        error = %persist_err,
                        "failed to persist backfill checkpoint"
                    );
                }
            }
        }

        progress.add(added);
        let elapsed = started.elapsed();
        metrics::histogram!("kestrel_ddl_batch_seconds", "op" => "add_index")
            .record(elapsed.as_secs_f64());

        if let Some(e) = err {
            tracing::warn!(
                job_id,
                total_rows = progress.rows(),
                batch_rows = added,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "index backfill round failed"
            );
            return Err(e);
        }
        tracing::info!(
            job_id,
            total_rows = progress.rows(),
            batch_rows = added,
            elapsed_ms = elapsed.as_millis() as u64,
            "index backfill round complete"
        );

        if ret_cnt < cfg.batch_count {
            return Ok(());
        }
    }
}

// ── bulk index dropper ───────────────────────────────────────────────

/// Delete every key under the index's prefix, one bounded transaction at a
/// time. Used by the drop state machine's reorganization phase and by
/// rollback teardown.
pub fn drop_table_index(
    store: &dyn KvStore,
    ctx: &ReorgContext,
    cfg: &DdlConfig,
    table_id: TableId,
    index_id: IndexId,
) -> DdlResult<()> {
    let prefix = codec::encode_table_index_prefix(table_id, index_id);
    let mut total: u64 = 0;
    loop {
        ctx.is_reorg_runnable()?;
        let started = Instant::now();
        let deleted: usize = run_in_new_txn(store, true, |txn| {
            let snap = store.get_snapshot(txn.start_ts()).map_err(DdlError::from)?;
            let mut it = snap.seek(&prefix);
            let mut keys: Vec<Vec<u8>> = Vec::new();
            while it.valid() && it.key().starts_with(&prefix) && keys.len() < cfg.delete_batch_size
            {
                keys.push(it.key().to_vec());
                it.next().map_err(DdlError::from)?;
            }
            for key in &keys {
                txn.delete(key);
            }
            Ok::<usize, DdlError>(keys.len())
        })?;
        total += deleted as u64;
        metrics::histogram!("kestrel_ddl_batch_seconds", "op" => "drop_index")
            .record(started.elapsed().as_secs_f64());

        if deleted < cfg.delete_batch_size {
            tracing::info!(
                table_id = %table_id,
                index_id = %index_id,
                deleted = total,
                "index keyspace dropped"
            );
            return Ok(());
        }
    }
}
