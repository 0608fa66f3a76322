//! In-process object store.
//!
//! Single-lock implementation of [`KvStore`]: writes are linearizable by
//! construction, watch history is a bounded ring, leases are wall-clock TTL
//! records. Used by dev mode and the test suites; a replicated store mounts
//! behind the same trait in production deployments.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::error::{Result, StoreError};
use super::kv::{
    Compare, Fence, KvEntry, KvStore, LeaseHandle, LeaseInfo, Txn, TxnOp, WatchEvent,
};

/// Watch history retained for replay before the stream goes live.
const HISTORY_CAP: usize = 1024;
/// Per-watcher channel capacity. A watcher that falls this far behind is
/// closed; the consumer must re-list and re-watch.
const WATCH_BUFFER: usize = 256;

struct LeaseRecord {
    revision: u64,
    ttl: Duration,
    expires_at: Instant,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, KvEntry>,
    revision: u64,
    history: VecDeque<WatchEvent>,
    /// Events at or below this revision are no longer replayable.
    compacted_rev: u64,
    leases: HashMap<String, LeaseRecord>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn check_fence(&self, fence: &Fence) -> Result<()> {
        let rec = self
            .leases
            .get(&fence.lease_name)
            .ok_or_else(|| StoreError::Conflict(format!("fence lease {} gone", fence.lease_name)))?;
        if rec.revision != fence.lease_revision {
            return Err(StoreError::Conflict(format!(
                "stale fencing token for {} (held {}, presented {})",
                fence.lease_name, rec.revision, fence.lease_revision
            )));
        }
        if rec.expires_at <= Instant::now() {
            return Err(StoreError::Conflict(format!(
                "fence lease {} expired",
                fence.lease_name
            )));
        }
        Ok(())
    }

    fn check_compare(&self, cmp: &Compare) -> Result<()> {
        match cmp {
            Compare::RevisionEquals(key, rev) => match self.data.get(key) {
                Some(e) if e.revision == *rev => Ok(()),
                Some(e) => Err(StoreError::Conflict(format!(
                    "revision mismatch on {key}: expected {rev}, got {}",
                    e.revision
                ))),
                None => Err(StoreError::Conflict(format!("{key} does not exist"))),
            },
            Compare::Exists(key) => {
                if self.data.contains_key(key) {
                    Ok(())
                } else {
                    Err(StoreError::Conflict(format!("{key} does not exist")))
                }
            }
            Compare::NotExists(key) => {
                if self.data.contains_key(key) {
                    Err(StoreError::Conflict(format!("{key} already exists")))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn publish(&mut self, event: WatchEvent) {
        self.history.push_back(event.clone());
        if self.history.len() > HISTORY_CAP {
            if let Some(old) = self.history.pop_front() {
                match old {
                    WatchEvent::Put(e) => self.compacted_rev = e.revision,
                    WatchEvent::Delete { revision, .. } => self.compacted_rev = revision,
                    WatchEvent::Compacted => {}
                }
            }
        }

        let key = match event.key() {
            Some(k) => k.to_string(),
            None => return,
        };
        // Slow watchers are dropped; a closed channel is the gap signal.
        self.watchers
            .retain(|w| !key.starts_with(&w.prefix) || w.tx.try_send(event.clone()).is_ok());
    }
}

/// In-memory [`KvStore`].
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.data.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvEntry>, u64)> {
        let inner = self.inner.lock().expect("store lock");
        let entries = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.clone())
            .collect();
        Ok((entries, inner.revision))
    }

    async fn txn(&self, txn: Txn, fence: Option<&Fence>) -> Result<u64> {
        let mut inner = self.inner.lock().expect("store lock");

        if let Some(f) = fence {
            inner.check_fence(f)?;
        }
        for cmp in &txn.compares {
            inner.check_compare(cmp)?;
        }

        inner.revision += 1;
        let rev = inner.revision;
        for op in txn.ops {
            match op {
                TxnOp::Put { key, value } => {
                    let entry = KvEntry {
                        key: key.clone(),
                        value,
                        revision: rev,
                    };
                    inner.data.insert(key, entry.clone());
                    inner.publish(WatchEvent::Put(entry));
                }
                TxnOp::Delete { key } => {
                    if inner.data.remove(&key).is_some() {
                        inner.publish(WatchEvent::Delete { key, revision: rev });
                    }
                }
            }
        }
        Ok(rev)
    }

    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut inner = self.inner.lock().expect("store lock");

        if from_revision < inner.compacted_rev {
            // Start point predates retained history; the consumer must
            // re-list before resuming.
            let _ = tx.try_send(WatchEvent::Compacted);
        } else {
            for ev in inner.history.iter() {
                let rev = match ev {
                    WatchEvent::Put(e) => e.revision,
                    WatchEvent::Delete { revision, .. } => *revision,
                    WatchEvent::Compacted => continue,
                };
                let matches = ev.key().map(|k| k.starts_with(prefix)).unwrap_or(false);
                if rev > from_revision && matches {
                    let _ = tx.try_send(ev.clone());
                }
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn acquire_lease(&self, name: &str, ttl: Duration) -> Result<Box<dyn LeaseHandle>> {
        let mut inner = self.inner.lock().expect("store lock");
        let now = Instant::now();

        if let Some(rec) = inner.leases.get(name) {
            if rec.expires_at > now {
                return Err(StoreError::Conflict(format!("lease {name} is held")));
            }
        }

        inner.revision += 1;
        let revision = inner.revision;
        inner.leases.insert(
            name.to_string(),
            LeaseRecord {
                revision,
                ttl,
                expires_at: now + ttl,
            },
        );

        Ok(Box::new(MemLease {
            store: self.inner.clone(),
            name: name.to_string(),
            revision,
        }))
    }

    async fn keep_lease_alive(&self, name: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let now = Instant::now();
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .leases
            .entry(name.to_string())
            .and_modify(|rec| {
                rec.ttl = ttl;
                rec.expires_at = now + ttl;
            })
            .or_insert(LeaseRecord {
                revision,
                ttl,
                expires_at: now + ttl,
            });
        Ok(())
    }

    async fn lease_info(&self, name: &str) -> Result<Option<LeaseInfo>> {
        let inner = self.inner.lock().expect("store lock");
        let now = Instant::now();
        Ok(inner.leases.get(name).map(|rec| LeaseInfo {
            revision: rec.revision,
            expires_in: rec.expires_at.checked_duration_since(now),
            expired_for: now.checked_duration_since(rec.expires_at),
        }))
    }
}

struct MemLease {
    store: Arc<Mutex<Inner>>,
    name: String,
    revision: u64,
}

#[async_trait]
impl LeaseHandle for MemLease {
    fn name(&self) -> &str {
        &self.name
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    async fn renew(&self) -> Result<()> {
        let mut inner = self.store.lock().expect("store lock");
        let now = Instant::now();
        match inner.leases.get_mut(&self.name) {
            Some(rec) if rec.revision == self.revision && rec.expires_at > now => {
                rec.expires_at = now + rec.ttl;
                Ok(())
            }
            Some(rec) if rec.revision == self.revision => {
                Err(StoreError::Conflict(format!("lease {} expired", self.name)))
            }
            _ => Err(StoreError::Conflict(format!(
                "lease {} held by another owner",
                self.name
            ))),
        }
    }

    async fn is_valid(&self) -> bool {
        let inner = self.store.lock().expect("store lock");
        inner
            .leases
            .get(&self.name)
            .map(|rec| rec.revision == self.revision && rec.expires_at > Instant::now())
            .unwrap_or(false)
    }

    async fn release(&self) -> Result<()> {
        let mut inner = self.store.lock().expect("store lock");
        if let Some(rec) = inner.leases.get(&self.name) {
            if rec.revision == self.revision {
                inner.leases.remove(&self.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> Txn {
        Txn::new().put(key, value.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_txn_cas() {
        let store = MemStore::new();
        let rev = store.txn(put("/vm/p/a", "1"), None).await.unwrap();

        // Matching revision succeeds.
        let txn = put("/vm/p/a", "2").compare(Compare::RevisionEquals("/vm/p/a".into(), rev));
        let rev2 = store.txn(txn, None).await.unwrap();
        assert!(rev2 > rev);

        // Stale revision conflicts.
        let txn = put("/vm/p/a", "3").compare(Compare::RevisionEquals("/vm/p/a".into(), rev));
        assert!(matches!(
            store.txn(txn, None).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_txn_not_exists() {
        let store = MemStore::new();
        let txn = put("/vm/p/a", "1").compare(Compare::NotExists("/vm/p/a".into()));
        store.txn(txn, None).await.unwrap();

        let txn = put("/vm/p/a", "1").compare(Compare::NotExists("/vm/p/a".into()));
        assert!(store.txn(txn, None).await.is_err());
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = MemStore::new();
        store.txn(put("/vm/p/a", "1"), None).await.unwrap();
        store.txn(put("/vm/p/b", "2"), None).await.unwrap();
        store.txn(put("/volume/p/c", "3"), None).await.unwrap();

        let (entries, _) = store.list("/vm/").await.unwrap();
        assert_eq!(entries.len(), 2);
        let (entries, _) = store.list("/volume/").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_replay_and_live() {
        let store = MemStore::new();
        let rev = store.txn(put("/vm/p/a", "1"), None).await.unwrap();
        store.txn(put("/vm/p/b", "2"), None).await.unwrap();

        // Replay from the first revision sees only the second put.
        let mut rx = store.watch("/vm/", rev).await.unwrap();
        match rx.recv().await.unwrap() {
            WatchEvent::Put(e) => assert_eq!(e.key, "/vm/p/b"),
            other => panic!("unexpected event {other:?}"),
        }

        // Live event.
        store.txn(put("/vm/p/c", "3"), None).await.unwrap();
        match rx.recv().await.unwrap() {
            WatchEvent::Put(e) => assert_eq!(e.key, "/vm/p/c"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watch_compaction_signal() {
        let store = MemStore::new();
        store.txn(put("/vm/p/seed", "0"), None).await.unwrap();
        for i in 0..(HISTORY_CAP + 10) {
            store
                .txn(put(&format!("/vm/p/k{i}"), "x"), None)
                .await
                .unwrap();
        }

        // Revision 0 predates retained history.
        let mut rx = store.watch("/vm/", 0).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Compacted));
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let store = MemStore::new();
        let lease = store
            .acquire_lease("controller/vm", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(lease.is_valid().await);

        // Second acquire fails while held.
        assert!(store
            .acquire_lease("controller/vm", Duration::from_millis(40))
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!lease.is_valid().await);

        // Reacquirable after expiry, with a higher fencing revision.
        let lease2 = store
            .acquire_lease("controller/vm", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(lease2.revision() > lease.revision());
        // The old holder can no longer renew.
        assert!(lease.renew().await.is_err());
    }

    #[tokio::test]
    async fn test_fenced_write_rejected_after_takeover() {
        let store = MemStore::new();
        let lease = store
            .acquire_lease("controller/vm", Duration::from_millis(30))
            .await
            .unwrap();
        let stale = Fence {
            lease_name: "controller/vm".to_string(),
            lease_revision: lease.revision(),
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let lease2 = store
            .acquire_lease("controller/vm", Duration::from_secs(5))
            .await
            .unwrap();

        // Writes fenced on the old revision are rejected.
        assert!(store.txn(put("/vm/p/a", "1"), Some(&stale)).await.is_err());

        // The successor's fence works.
        let fresh = Fence {
            lease_name: "controller/vm".to_string(),
            lease_revision: lease2.revision(),
        };
        store.txn(put("/vm/p/a", "1"), Some(&fresh)).await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_info_tracks_expiry() {
        let store = MemStore::new();
        store
            .keep_lease_alive("node/n-1/alive", Duration::from_millis(30))
            .await
            .unwrap();

        let info = store.lease_info("node/n-1/alive").await.unwrap().unwrap();
        assert!(info.expires_in.is_some());
        assert!(info.expired_for.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = store.lease_info("node/n-1/alive").await.unwrap().unwrap();
        assert!(info.expires_in.is_none());
        assert!(info.expired_for.is_some());
    }
}
