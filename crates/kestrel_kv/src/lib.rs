//! Transactional key-value layer.
//!
//! The DDL engine consumes the traits below; `MemStore` is the in-process
//! implementation used for embedding and tests. Keys are ordered byte
//! strings; versions are monotone commit timestamps.

pub mod codec;
pub mod memory;

pub use memory::MemStore;

use kestrel_common::error::{KvError, RetryableError};

/// Upper bound on optimistic transaction retries in [`run_in_new_txn`].
pub const MAX_TXN_RETRIES: usize = 10;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// A transactional, versioned key-value store.
pub trait KvStore: Send + Sync {
    /// Begin a read-write transaction at the current version.
    fn begin(&self) -> Box<dyn Transaction + '_>;

    /// Open a read-only snapshot at `version`. Fails with
    /// [`KvError::InvalidVersion`] if the version is in the future.
    fn get_snapshot(&self, version: u64) -> Result<Box<dyn Snapshot + '_>, KvError>;

    /// The newest committed version.
    fn current_version(&self) -> u64;
}

/// A point-in-time consistent read view.
pub trait Snapshot {
    fn get(&self, key: &[u8]) -> Option<Value>;

    /// Ordered iteration over keys ≥ `key`.
    fn seek(&self, key: &[u8]) -> Box<dyn SnapshotIter + '_>;
}

/// Iterator over a snapshot. Positioned on a key while `valid()`.
pub trait SnapshotIter {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn next(&mut self) -> Result<(), KvError>;

    /// Advance past every key sharing `prefix`. Returns
    /// [`KvError::NotExist`] when the iterator runs off the end of the
    /// keyspace, which callers treat as end-of-range.
    fn next_until(&mut self, prefix: &[u8]) -> Result<(), KvError> {
        while self.valid() {
            if !self.key().starts_with(prefix) {
                return Ok(());
            }
            self.next()?;
        }
        Err(KvError::NotExist)
    }
}

/// A read-write transaction with buffered writes, snapshot reads at its
/// start timestamp, and first-committer-wins conflict detection.
pub trait Transaction {
    /// The version this transaction reads at.
    fn start_ts(&self) -> u64;

    /// Read-your-writes, then the snapshot at `start_ts`.
    fn get(&self, key: &[u8]) -> Option<Value>;

    fn set(&mut self, key: &[u8], value: Value);

    fn delete(&mut self, key: &[u8]);

    /// Lock keys against concurrent writers for the remainder of this
    /// transaction. Fails with a retryable conflict if another live
    /// transaction holds a lock or a newer version was committed.
    fn lock_keys(&mut self, keys: &[&[u8]]) -> Result<(), KvError>;

    fn commit(self: Box<Self>) -> Result<(), KvError>;

    fn rollback(self: Box<Self>);
}

/// Run `f` inside a fresh transaction, committing on success.
///
/// When `retryable` is true, conflict errors restart `f` in a new
/// transaction (bounded by [`MAX_TXN_RETRIES`]); any other error aborts
/// and propagates. The closure must therefore be idempotent up to its
/// own writes, which are discarded on abort.
pub fn run_in_new_txn<T, E, F>(store: &dyn KvStore, retryable: bool, mut f: F) -> Result<T, E>
where
    E: From<KvError> + RetryableError,
    F: FnMut(&mut dyn Transaction) -> Result<T, E>,
{
    for _ in 0..MAX_TXN_RETRIES {
        let mut txn = store.begin();
        match f(txn.as_mut()) {
            Ok(v) => match txn.commit() {
                Ok(()) => return Ok(v),
                Err(e) => {
                    if retryable && e.is_retryable() {
                        continue;
                    }
                    return Err(e.into());
                }
            },
            Err(e) => {
                txn.rollback();
                if retryable && e.is_retryable() {
                    continue;
                }
                return Err(e);
            }
        }
    }
    Err(KvError::TxnRetryLimit.into())
}
