//! Error taxonomy for the key-value layer and the DDL engine.
//!
//! Error kinds are distinguishable variants, never strings: handlers
//! dispatch on them (a duplicate key during backfill drives rollback, a
//! reorg wait timeout is swallowed, validation failures cancel the job).

use thiserror::Error;

use crate::schema::IndexState;
use crate::types::Handle;

/// Convenience alias for `Result<T, DdlError>`.
pub type DdlResult<T> = Result<T, DdlError>;

/// Classifies whether a failed transaction attempt may be retried with a
/// fresh timestamp.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

/// Key-value layer errors.
#[derive(Error, Debug, Clone)]
pub enum KvError {
    /// The key already exists; carries the handle owning the conflicting
    /// entry so backfill can distinguish "our own entry raced ahead" from
    /// a genuine uniqueness violation.
    #[error("key already exists (held by handle {handle})")]
    KeyExists { handle: Handle },

    #[error("key does not exist")]
    NotExist,

    #[error("write conflict: key committed after transaction start")]
    WriteConflict,

    #[error("transaction retry limit exceeded")]
    TxnRetryLimit,

    #[error("snapshot version {0} is not readable")]
    InvalidVersion(u64),

    #[error("codec error: {0}")]
    Codec(String),
}

impl RetryableError for KvError {
    fn is_retryable(&self) -> bool {
        matches!(self, KvError::WriteConflict)
    }
}

/// DDL engine errors.
#[derive(Error, Debug, Clone)]
pub enum DdlError {
    // ── validation (cancel the job) ──────────────────────────────────
    #[error("key column does not exist: {column}")]
    KeyColumnDoesNotExist { column: String },

    #[error("BLOB/TEXT column used in key specification without a key length")]
    BlobKeyWithoutLength,

    #[error("incorrect prefix key: the used key part is not a string")]
    IncorrectPrefixKey,

    #[error("specified key length {length} exceeds maximum of {max}")]
    TooLongKey { length: usize, max: usize },

    #[error("duplicate column name in key specification: {column}")]
    DupColumnName { column: String },

    #[error("duplicate key name: {name}")]
    DupKeyName { name: String },

    #[error("can't drop index: {name} doesn't exist")]
    CantDropFieldOrKey { name: String },

    #[error("malformed job arguments: {0}")]
    BadJobArgs(String),

    #[error("table not found")]
    TableNotFound,

    // ── fatal / propagated ───────────────────────────────────────────
    #[error("invalid index state: {0}")]
    InvalidIndexState(IndexState),

    #[error("invalid table state")]
    InvalidTableState,

    #[error("metastore error: {0}")]
    Meta(String),

    #[error(transparent)]
    Kv(#[from] KvError),

    // ── reorganization control flow ──────────────────────────────────
    /// The reorg wait elapsed before the background task finished. Not a
    /// failure: the handler returns without advancing state and the owner
    /// loop re-invokes after re-election.
    #[error("wait for reorganization timed out")]
    WaitReorgTimeout,

    #[error("this node is no longer the DDL owner")]
    NotOwner,

    #[error("job has been cancelled")]
    JobCancelled,
}

impl DdlError {
    /// Validation failures mark the job `Cancelled` before returning.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DdlError::KeyColumnDoesNotExist { .. }
                | DdlError::BlobKeyWithoutLength
                | DdlError::IncorrectPrefixKey
                | DdlError::TooLongKey { .. }
                | DdlError::DupColumnName { .. }
                | DdlError::DupKeyName { .. }
                | DdlError::CantDropFieldOrKey { .. }
                | DdlError::BadJobArgs(_)
        )
    }

    /// A duplicate-key signal from the store. During backfill this is the
    /// trigger for rollback conversion, not a terminal user error.
    pub fn is_key_exists(&self) -> bool {
        matches!(self, DdlError::Kv(KvError::KeyExists { .. }))
    }
}

impl RetryableError for DdlError {
    fn is_retryable(&self) -> bool {
        match self {
            DdlError::Kv(e) => e.is_retryable(),
            _ => false,
        }
    }
}
