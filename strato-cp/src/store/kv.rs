//! Object Store interface.
//!
//! The control plane consumes a linearizable key-value store with watches
//! and leases. [`MemStore`](super::mem::MemStore) is the in-process
//! implementation used by dev mode and tests; a replicated backend plugs in
//! behind the same trait.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::Result;

/// One stored key with the revision of its last write.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Watch stream payload. Events for a single key are monotone in revision
/// and delivered at least once; consumers must tolerate duplicates.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KvEntry),
    Delete { key: String, revision: u64 },
    /// The watcher fell behind compaction. Consumers must re-list and resume
    /// from the list's revision.
    Compacted,
}

impl WatchEvent {
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Put(e) => Some(&e.key),
            WatchEvent::Delete { key, .. } => Some(key),
            WatchEvent::Compacted => None,
        }
    }
}

/// Preconditions for transactional writes.
#[derive(Debug, Clone)]
pub enum Compare {
    /// Key must exist with exactly this revision.
    RevisionEquals(String, u64),
    Exists(String),
    NotExists(String),
}

#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// All-or-nothing multi-key write guarded by compares.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compare(mut self, c: Compare) -> Self {
        self.compares.push(c);
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(TxnOp::Put { key: key.into(), value });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(TxnOp::Delete { key: key.into() });
        self
    }
}

/// Fencing token carried by writes that must not survive a leadership
/// change. The store rejects the write when the named lease no longer holds
/// this revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub lease_name: String,
    pub lease_revision: u64,
}

/// Observed state of a lease, for liveness decisions.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub revision: u64,
    /// Time remaining before expiry; None once expired.
    pub expires_in: Option<Duration>,
    /// How long ago the lease expired; None while still valid.
    pub expired_for: Option<Duration>,
}

/// Handle to an acquired lease.
#[async_trait]
pub trait LeaseHandle: Send + Sync {
    fn name(&self) -> &str;
    /// Fencing token: the store revision at which this lease was acquired.
    fn revision(&self) -> u64;
    async fn renew(&self) -> Result<()>;
    async fn is_valid(&self) -> bool;
    async fn release(&self) -> Result<()>;
}

/// Linearizable object store with watches and leases.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Entries under `prefix` in key order, with the store revision the
    /// listing was taken at.
    async fn list(&self, prefix: &str) -> Result<(Vec<KvEntry>, u64)>;

    /// Commit a transaction. Fails with `Conflict` when a compare does not
    /// hold or the fence is stale. Returns the commit revision.
    async fn txn(&self, txn: Txn, fence: Option<&Fence>) -> Result<u64>;

    /// Watch events under `prefix` from `from_revision` (exclusive).
    /// Replays history where available; emits `Compacted` when the start
    /// revision predates retained history.
    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<mpsc::Receiver<WatchEvent>>;

    /// Acquire a lease, failing with `Conflict` while a valid holder exists.
    /// Expired leases are reacquirable immediately.
    async fn acquire_lease(&self, name: &str, ttl: Duration) -> Result<Box<dyn LeaseHandle>>;

    /// Renew a lease by name without holding its handle; used by the node
    /// heartbeat path. Creates the lease when absent.
    async fn keep_lease_alive(&self, name: &str, ttl: Duration) -> Result<()>;

    /// Current state of a lease, including expired ones not yet released.
    async fn lease_info(&self, name: &str) -> Result<Option<LeaseInfo>>;
}
