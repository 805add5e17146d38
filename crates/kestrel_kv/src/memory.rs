//! In-memory versioned store.
//!
//! Every key maps to a version chain of `(commit_version, value)` pairs,
//! tombstones included. Transactions buffer their writes, read their own
//! writes before the snapshot at their start timestamp, and validate at
//! commit that nothing they wrote or locked was committed after they
//! started (first committer wins). Snapshots read the newest version at
//! or below their version.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use kestrel_common::error::KvError;

use crate::{Key, KvStore, Snapshot, SnapshotIter, Transaction, Value};

type VersionChain = Vec<(u64, Option<Value>)>;

fn visible<'a>(chain: &'a VersionChain, version: u64) -> Option<&'a Option<Value>> {
    chain
        .iter()
        .rev()
        .find(|(ver, _)| *ver <= version)
        .map(|(_, v)| v)
}

/// The in-process store implementation.
pub struct MemStore {
    // Lock order: `locks` before `inner`.
    inner: RwLock<BTreeMap<Key, VersionChain>>,
    locks: Mutex<HashMap<Key, u64>>,
    version: AtomicU64,
    txn_seq: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            locks: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
            txn_seq: AtomicU64::new(0),
        }
    }

    fn latest_commit(&self, key: &[u8]) -> u64 {
        self.inner
            .read()
            .get(key)
            .and_then(|chain| chain.last().map(|(ver, _)| *ver))
            .unwrap_or(0)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemStore {
    fn begin(&self) -> Box<dyn Transaction + '_> {
        Box::new(MemTxn {
            store: self,
            txn_id: self.txn_seq.fetch_add(1, Ordering::Relaxed) + 1,
            start_ts: self.version.load(Ordering::SeqCst),
            writes: BTreeMap::new(),
            locked: Vec::new(),
            finished: false,
        })
    }

    fn get_snapshot(&self, version: u64) -> Result<Box<dyn Snapshot + '_>, KvError> {
        if version > self.version.load(Ordering::SeqCst) {
            return Err(KvError::InvalidVersion(version));
        }
        Ok(Box::new(MemSnapshot {
            store: self,
            version,
        }))
    }

    fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

// ── snapshots ────────────────────────────────────────────────────────

struct MemSnapshot<'a> {
    store: &'a MemStore,
    version: u64,
}

impl Snapshot for MemSnapshot<'_> {
    fn get(&self, key: &[u8]) -> Option<Value> {
        let inner = self.store.inner.read();
        inner
            .get(key)
            .and_then(|chain| visible(chain, self.version).cloned())
            .flatten()
    }

    fn seek(&self, key: &[u8]) -> Box<dyn SnapshotIter + '_> {
        let inner = self.store.inner.read();
        let entries: Vec<(Key, Value)> = inner
            .range((Bound::Included(key.to_vec()), Bound::Unbounded))
            .filter_map(|(k, chain)| {
                visible(chain, self.version)
                    .and_then(|v| v.clone())
                    .map(|v| (k.clone(), v))
            })
            .collect();
        Box::new(MemSnapIter { entries, pos: 0 })
    }
}

struct MemSnapIter {
    entries: Vec<(Key, Value)>,
    pos: usize,
}

impl SnapshotIter for MemSnapIter {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }

    fn next(&mut self) -> Result<(), KvError> {
        if !self.valid() {
            return Err(KvError::NotExist);
        }
        self.pos += 1;
        Ok(())
    }
}

// ── transactions ─────────────────────────────────────────────────────

struct MemTxn<'a> {
    store: &'a MemStore,
    txn_id: u64,
    start_ts: u64,
    writes: BTreeMap<Key, Option<Value>>,
    locked: Vec<Key>,
    finished: bool,
}

impl MemTxn<'_> {
    fn release_locks(&mut self) {
        if self.locked.is_empty() {
            return;
        }
        let mut locks = self.store.locks.lock();
        for key in self.locked.drain(..) {
            if locks.get(&key) == Some(&self.txn_id) {
                locks.remove(&key);
            }
        }
    }
}

impl Transaction for MemTxn<'_> {
    fn start_ts(&self) -> u64 {
        self.start_ts
    }

    fn get(&self, key: &[u8]) -> Option<Value> {
        if let Some(buffered) = self.writes.get(key) {
            return buffered.clone();
        }
        let inner = self.store.inner.read();
        inner
            .get(key)
            .and_then(|chain| visible(chain, self.start_ts).cloned())
            .flatten()
    }

    fn set(&mut self, key: &[u8], value: Value) {
        self.writes.insert(key.to_vec(), Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn lock_keys(&mut self, keys: &[&[u8]]) -> Result<(), KvError> {
        let mut locks = self.store.locks.lock();
        for key in keys {
            match locks.get(*key) {
                Some(owner) if *owner != self.txn_id => return Err(KvError::WriteConflict),
                _ => {}
            }
            if self.store.latest_commit(key) > self.start_ts {
                return Err(KvError::WriteConflict);
            }
            locks.insert(key.to_vec(), self.txn_id);
            self.locked.push(key.to_vec());
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), KvError> {
        let mut locks = self.store.locks.lock();
        let mut inner = self.store.inner.write();

        let conflicted = self
            .writes
            .keys()
            .chain(self.locked.iter())
            .any(|key| {
                inner
                    .get(key)
                    .and_then(|chain| chain.last())
                    .map(|(ver, _)| *ver > self.start_ts)
                    .unwrap_or(false)
            });
        if conflicted {
            for key in self.locked.drain(..) {
                if locks.get(&key) == Some(&self.txn_id) {
                    locks.remove(&key);
                }
            }
            self.finished = true;
            return Err(KvError::WriteConflict);
        }

        if !self.writes.is_empty() {
            let commit_ts = self.store.version.fetch_add(1, Ordering::SeqCst) + 1;
            for (key, value) in std::mem::take(&mut self.writes) {
                inner.entry(key).or_default().push((commit_ts, value));
            }
        }

        for key in self.locked.drain(..) {
            if locks.get(&key) == Some(&self.txn_id) {
                locks.remove(&key);
            }
        }
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        self.release_locks();
        self.finished = true;
    }
}

impl Drop for MemTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.release_locks();
        }
    }
}
