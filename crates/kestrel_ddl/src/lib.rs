//! Online secondary-index lifecycle engine.
//!
//! Implements CREATE INDEX and DROP INDEX as online schema changes over a
//! transactional key-value store: a multi-state descriptor state machine
//! driven by an external job queue, a concurrent backfill pipeline with
//! resumable checkpointing, and a symmetric rollback path for unique-key
//! violations discovered during backfill.
//!
//! The engine assumes it runs on the elected DDL owner. The external job
//! loop invokes [`DdlEngine::on_create_index`] / [`DdlEngine::on_drop_index`]
//! repeatedly, persisting the job between invocations, until the job
//! reaches a terminal state. Each invocation advances the index by at most
//! one state and commits the updated table descriptor before returning.

pub mod index;
pub mod meta;
pub mod reorg;
pub mod table;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kestrel_kv::KvStore;

use crate::reorg::ReorgContext;

/// Tunables of the backfill and bulk-delete pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlConfig {
    /// Concurrent batch workers per backfill round.
    pub batch_count: usize,
    /// Rows per batch transaction.
    pub batch_size: usize,
    /// Keys deleted per transaction when dropping an index keyspace.
    pub delete_batch_size: usize,
    /// How long a handler invocation waits for the background
    /// reorganization before returning `WaitReorgTimeout` (swallowed).
    pub reorg_wait_timeout_ms: u64,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            batch_count: 16,
            batch_size: 128,
            delete_batch_size: 1024,
            reorg_wait_timeout_ms: 5000,
        }
    }
}

impl DdlConfig {
    pub fn reorg_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.reorg_wait_timeout_ms)
    }
}

/// The index lifecycle engine. One instance per DDL owner node.
pub struct DdlEngine<S: KvStore + 'static> {
    pub(crate) store: Arc<S>,
    pub(crate) cfg: DdlConfig,
    pub(crate) ctx: Arc<ReorgContext>,
}

impl<S: KvStore + 'static> DdlEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, DdlConfig::default())
    }

    pub fn with_config(store: Arc<S>, cfg: DdlConfig) -> Self {
        Self {
            store,
            cfg,
            ctx: Arc::new(ReorgContext::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &DdlConfig {
        &self.cfg
    }

    /// Flip DDL ownership. Running backfill workers observe the change at
    /// their next transaction start and abort with `NotOwner`.
    pub fn set_owner(&self, owner: bool) {
        self.ctx.set_owner(owner);
    }

    /// Mark the currently running job cancelled; backfill workers abort
    /// with `JobCancelled` at their next transaction start.
    pub fn set_job_cancelled(&self, cancelled: bool) {
        self.ctx.set_job_cancelled(cancelled);
    }
}
