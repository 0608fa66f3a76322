//! Leader election over a store lease.
//!
//! Every replica runs the elector; only the holder of the controller lease
//! runs controllers. The fencing token is the lease revision: controller
//! registries attach it to every write, and the store rejects writes fenced
//! on a superseded revision, so a deposed leader cannot clobber its
//! successor even when it has not yet noticed the loss.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::kv::{Fence, KvStore};

/// Published leadership state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderState {
    Standby,
    Leading { fence: Fence },
}

impl LeaderState {
    pub fn is_leading(&self) -> bool {
        matches!(self, LeaderState::Leading { .. })
    }

    pub fn fence(&self) -> Option<&Fence> {
        match self {
            LeaderState::Leading { fence } => Some(fence),
            LeaderState::Standby => None,
        }
    }
}

pub struct LeaderElector {
    kv: Arc<dyn KvStore>,
    lease_name: String,
    ttl: Duration,
    state_tx: watch::Sender<LeaderState>,
}

impl LeaderElector {
    pub fn new(kv: Arc<dyn KvStore>, name: &str, ttl: Duration) -> (Self, watch::Receiver<LeaderState>) {
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            Self {
                kv,
                lease_name: format!("controller/{name}"),
                ttl,
                state_tx,
            },
            state_rx,
        )
    }

    /// Campaign loop. Renews at TTL/3; a single failed renewal demotes to
    /// standby immediately so controllers stop well inside the window the
    /// successor waits before taking over.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let renew_every = self.ttl / 3;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let lease = match self.kv.acquire_lease(&self.lease_name, self.ttl).await {
                Ok(lease) => lease,
                Err(_) => {
                    // Held by a peer; poll again after a renewal period.
                    tokio::select! {
                        _ = tokio::time::sleep(renew_every) => continue,
                        _ = shutdown.changed() => continue,
                    }
                }
            };

            let fence = Fence {
                lease_name: self.lease_name.clone(),
                lease_revision: lease.revision(),
            };
            info!(lease = %self.lease_name, revision = fence.lease_revision, "acquired leadership");
            let _ = self.state_tx.send(LeaderState::Leading { fence });

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(renew_every) => {
                        if let Err(e) = lease.renew().await {
                            warn!(lease = %self.lease_name, "lost leadership: {e}");
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let _ = lease.release().await;
                            let _ = self.state_tx.send(LeaderState::Standby);
                            return;
                        }
                    }
                }
            }

            // Demote before any retry; controllers observe this and quiesce.
            let _ = self.state_tx.send(LeaderState::Standby);
        }
        let _ = self.state_tx.send(LeaderState::Standby);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;

    #[tokio::test]
    async fn test_single_elector_leads() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let (elector, mut state) = LeaderElector::new(kv, "vm", Duration::from_millis(200));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(elector.run(shutdown_rx));

        state.changed().await.unwrap();
        assert!(state.borrow().is_leading());
        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_second_elector_waits_then_takes_over() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());

        let lease = kv
            .acquire_lease("controller/vm", Duration::from_millis(80))
            .await
            .unwrap();
        let first_rev = lease.revision();

        let (elector, mut state) = LeaderElector::new(kv.clone(), "vm", Duration::from_millis(80));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(elector.run(shutdown_rx));

        // Standby while the other holder is alive; takes over after expiry
        // (the holder never renews).
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                state.changed().await.unwrap();
                if state.borrow().is_leading() {
                    break;
                }
            }
        })
        .await
        .expect("takeover");

        let fence = state.borrow().fence().cloned().unwrap();
        assert!(fence.lease_revision > first_rev);
        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_release_on_shutdown() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let (elector, mut state) = LeaderElector::new(kv.clone(), "vm", Duration::from_secs(5));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(elector.run(shutdown_rx));

        state.changed().await.unwrap();
        assert!(state.borrow().is_leading());

        let _ = shutdown_tx.send(true);
        let _ = handle.await;

        // Lease released: immediately reacquirable.
        assert!(kv
            .acquire_lease("controller/vm", Duration::from_secs(1))
            .await
            .is_ok());
    }
}
