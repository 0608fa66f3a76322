//! Control-plane configuration.

use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::ha::HaConfig;
use crate::model::SchedulingPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    /// REST bind address.
    pub listen: String,
    /// Object store endpoint; `memory` runs the in-process store.
    pub store: String,
    /// Leader lease TTL; renewal runs at a third of it.
    pub lease_ttl: Duration,
    pub reconcile_timeout: Duration,
    pub rpc_timeout: Duration,
    /// Graceful-stop window before a stop escalates to force.
    pub stop_grace: Duration,
    pub resync_interval: Duration,
    pub migration_timeout: Duration,
    pub default_policy: SchedulingPolicy,
    /// Node liveness lease TTL.
    pub t_alive: Duration,
    /// Expiry-to-fence window.
    pub t_fence: Duration,
    /// Workers per controller.
    pub controller_workers: usize,
    /// Dev mode: single process, in-memory store, loopback hypervisors.
    pub dev: bool,
    /// Number of simulated hosts in dev mode.
    pub dev_nodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "[::]:8080".to_string(),
            store: "memory".to_string(),
            lease_ttl: Duration::from_secs(15),
            reconcile_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(30),
            resync_interval: Duration::from_secs(60),
            migration_timeout: Duration::from_secs(30 * 60),
            default_policy: SchedulingPolicy::Balanced,
            t_alive: Duration::from_secs(10),
            t_fence: Duration::from_secs(30),
            controller_workers: 2,
            dev: false,
            dev_nodes: 0,
        }
    }
}

impl Config {
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            reconcile_timeout: self.reconcile_timeout,
            rpc_timeout: self.rpc_timeout,
            stop_grace: self.stop_grace,
            resync_interval: self.resync_interval,
            migration_timeout: self.migration_timeout,
            default_policy: self.default_policy,
        }
    }

    pub fn ha(&self) -> HaConfig {
        HaConfig {
            t_alive: self.t_alive,
            t_fence: self.t_fence,
            check_interval: Duration::from_secs(1).min(self.t_fence / 4).max(Duration::from_millis(100)),
        }
    }
}
