//! Heartbeat monitor
//!
//! Periodically evaluates instance leases against the registry store:
//! - instances whose lease expired are marked DOWN and an `Evicted` event is emitted
//! - DOWN instances that stay expired past the eviction grace are purged
//!
//! Evictions are pure local state transitions. A sweep that races a renewal
//! re-checks the lease under the instance's lock before committing, so the
//! renewal always wins.

use std::sync::Arc;
use std::time::Duration;

use teller_common::{DEFAULT_LEASE_DURATION_SECS, ShutdownSignal};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::store::RegistryStore;

/// Heartbeat monitor settings.
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    pub check_interval: Duration,
    /// How long an evicted instance stays visible as DOWN before removal
    pub eviction_grace: Duration,
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS / 3),
            eviction_grace: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS * 3),
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }
}

/// Outcome of a single sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instance ids marked DOWN in this pass
    pub evicted: Vec<String>,
    /// Instance ids removed from the store in this pass
    pub purged: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.purged.is_empty()
    }
}

pub struct HeartbeatMonitor {
    store: Arc<RegistryStore>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<RegistryStore>, config: HeartbeatConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Run one eviction pass.
    pub fn sweep(&self) -> SweepReport {
        let check_started = self.store.clock().now_millis();
        let grace_ms = self.config.eviction_grace.as_millis() as i64;
        let mut report = SweepReport::default();

        for instance_id in self.store.expired_candidates(check_started) {
            if let Some(instance) = self.store.evict_if_expired(&instance_id, check_started) {
                info!(
                    instance_id = %instance.instance_id,
                    service = %instance.service_name,
                    address = %instance.authority(),
                    last_renewal = instance.last_renewal_timestamp,
                    "Lease expired, instance marked DOWN"
                );
                report.evicted.push(instance_id);
            } else {
                debug!(instance_id = %instance_id, "Eviction skipped, lease renewed concurrently");
            }
        }

        for instance_id in self.store.purge_candidates(check_started, grace_ms) {
            if let Some(instance) = self.store.purge_if_stale(&instance_id, check_started, grace_ms)
            {
                info!(
                    instance_id = %instance.instance_id,
                    service = %instance.service_name,
                    "Purged instance after eviction grace"
                );
                report.purged.push(instance_id);
            }
        }

        if !report.is_empty() {
            info!(
                evicted = report.evicted.len(),
                purged = report.purged.len(),
                "Heartbeat sweep finished"
            );
        }
        report
    }

    /// Sweep on a fixed interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        if !self.config.enabled {
            info!("Heartbeat monitor disabled");
            return;
        }

        info!(
            interval_ms = self.config.check_interval.as_millis() as u64,
            grace_ms = self.config.eviction_grace.as_millis() as u64,
            "Starting heartbeat monitor"
        );

        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                _ = shutdown.wait() => {
                    break;
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }
}
