use std::sync::Arc;
use std::time::Duration;

use teller_config::ConfigSnapshotProvider;
use teller_registry::RegistryStore;

/// Shared state of the registry/config server handlers
pub struct AppState {
    pub registry: Arc<RegistryStore>,
    pub provider: Arc<ConfigSnapshotProvider>,
    /// Lease handed to registrations that do not ask for one
    pub lease_duration_secs: u64,
    /// Upper bound of a config long-poll
    pub max_wait: Duration,
}

impl AppState {
    pub fn new(registry: Arc<RegistryStore>, provider: Arc<ConfigSnapshotProvider>) -> Self {
        Self {
            registry,
            provider,
            lease_duration_secs: teller_common::DEFAULT_LEASE_DURATION_SECS,
            max_wait: Duration::from_secs(30),
        }
    }

    pub fn with_lease_duration(mut self, secs: u64) -> Self {
        self.lease_duration_secs = secs;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}
