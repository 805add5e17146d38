//! The DDL job record.
//!
//! Jobs are owned by an external queue; the engine only reads and writes
//! the fields below. The queue re-invokes the matching handler until the
//! job reaches a terminal state, persisting the job between invocations.

use serde::{Deserialize, Serialize};

use crate::error::{DdlError, DdlResult};
use crate::schema::IndexState;
use crate::types::{SchemaId, TableId};

/// Queue-level state of a DDL job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Done,
    Cancelled,
    /// The job is unwinding a partially applied change; for index
    /// creation this delegates to the drop state machine.
    Rollback,
    RollbackDone,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Cancelled | JobState::RollbackDone
        )
    }
}

/// What the job asks for; dispatch happens in the external queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    CreateIndex,
    DropIndex,
}

/// Arguments of a CREATE INDEX job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIndexArgs {
    pub unique: bool,
    pub name: String,
    /// Ordered `(column name, prefix length)` pairs.
    pub columns: Vec<IndexColSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexColSpec {
    pub name: String,
    pub length: Option<usize>,
}

/// Arguments of a DROP INDEX job (also written by rollback conversion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropIndexArgs {
    pub name: String,
}

/// A DDL job as the engine sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlJob {
    pub id: i64,
    pub kind: JobKind,
    pub schema_id: SchemaId,
    pub table_id: TableId,
    pub state: JobState,
    /// Mirrors the persisted descriptor state after each transition.
    pub schema_state: IndexState,
    /// Snapshot version the reorganization scan is pinned to; `0` until
    /// the first `WriteReorganization` invocation records one.
    pub snapshot_ver: u64,
    pub args: serde_json::Value,
    /// Rows processed by the backfill so far.
    pub row_count: i64,
}

impl DdlJob {
    pub fn create_index(
        id: i64,
        schema_id: SchemaId,
        table_id: TableId,
        args: &CreateIndexArgs,
    ) -> Self {
        Self {
            id,
            kind: JobKind::CreateIndex,
            schema_id,
            table_id,
            state: JobState::Running,
            schema_state: IndexState::None,
            snapshot_ver: 0,
            args: serde_json::to_value(args).expect("index args serialize"),
            row_count: 0,
        }
    }

    pub fn drop_index(id: i64, schema_id: SchemaId, table_id: TableId, name: &str) -> Self {
        Self {
            id,
            kind: JobKind::DropIndex,
            schema_id,
            table_id,
            state: JobState::Running,
            schema_state: IndexState::Public,
            snapshot_ver: 0,
            args: serde_json::to_value(DropIndexArgs {
                name: name.to_string(),
            })
            .expect("index args serialize"),
            row_count: 0,
        }
    }

    /// Decode the CREATE INDEX argument payload. A malformed payload is a
    /// validation failure: the caller cancels the job.
    pub fn decode_create_index_args(&self) -> DdlResult<CreateIndexArgs> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| DdlError::BadJobArgs(e.to_string()))
    }

    /// Decode the DROP INDEX argument payload.
    pub fn decode_drop_index_args(&self) -> DdlResult<DropIndexArgs> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| DdlError::BadJobArgs(e.to_string()))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
