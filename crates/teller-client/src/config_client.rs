//! Config client
//!
//! Polls or long-polls the config server for bundles of watched
//! (service, profile) pairs, remembers the last version seen and notifies
//! listeners when a newer version shows up.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use teller_api::{ConfigBundle, bundle_key};
use teller_common::ShutdownSignal;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::transport::ConfigTransport;

/// Receives bundles newer than the last one seen.
pub trait ConfigListener: Send + Sync + 'static {
    fn on_change(&self, bundle: &ConfigBundle);
}

/// A listener that invokes a closure.
pub struct FnConfigListener<F>
where
    F: Fn(&ConfigBundle) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnConfigListener<F>
where
    F: Fn(&ConfigBundle) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ConfigListener for FnConfigListener<F>
where
    F: Fn(&ConfigBundle) + Send + Sync + 'static,
{
    fn on_change(&self, bundle: &ConfigBundle) {
        (self.f)(bundle);
    }
}

pub struct ConfigClient {
    transport: Arc<dyn ConfigTransport>,
    /// Key: serviceName@@profile
    versions: DashMap<String, u64>,
    /// Key: serviceName@@profile
    snapshots: DashMap<String, ConfigBundle>,
    listeners: DashMap<String, Vec<Arc<dyn ConfigListener>>>,
    /// Pause after a failed poll
    retry_delay: Duration,
}

impl ConfigClient {
    pub fn new(transport: Arc<dyn ConfigTransport>) -> Self {
        Self {
            transport,
            versions: DashMap::new(),
            snapshots: DashMap::new(),
            listeners: DashMap::new(),
            retry_delay: Duration::from_secs(2),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn add_listener(&self, service_name: &str, profile: &str, listener: Arc<dyn ConfigListener>) {
        self.listeners
            .entry(bundle_key(service_name, profile))
            .or_default()
            .push(listener);
    }

    /// Last version seen for a pair, 0 when none.
    pub fn current_version(&self, service_name: &str, profile: &str) -> u64 {
        self.versions
            .get(&bundle_key(service_name, profile))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Last bundle seen for a pair.
    pub fn snapshot(&self, service_name: &str, profile: &str) -> Option<ConfigBundle> {
        self.snapshots
            .get(&bundle_key(service_name, profile))
            .map(|b| b.clone())
    }

    /// Fetch the latest bundle right away.
    pub async fn fetch(&self, service_name: &str, profile: &str) -> Result<Option<ConfigBundle>> {
        let bundle = self
            .transport
            .fetch(service_name, profile, None, None)
            .await?;
        if let Some(bundle) = &bundle {
            self.accept(bundle);
        }
        Ok(bundle)
    }

    /// Long-poll for a version newer than the last one seen.
    ///
    /// Returns `Ok(None)` when nothing newer arrived within `wait`.
    pub async fn wait(
        &self,
        service_name: &str,
        profile: &str,
        wait: Duration,
    ) -> Result<Option<ConfigBundle>> {
        let next = self.current_version(service_name, profile) + 1;
        let bundle = self
            .transport
            .fetch(service_name, profile, Some(next), Some(wait))
            .await?;

        Ok(bundle.filter(|b| self.accept(b)))
    }

    /// Record a bundle; notifies listeners and returns true if it is newer.
    fn accept(&self, bundle: &ConfigBundle) -> bool {
        let key = bundle.key();
        {
            let mut seen = self.versions.entry(key.clone()).or_insert(0);
            if bundle.version <= *seen {
                return false;
            }
            *seen = bundle.version;
        }
        self.snapshots.insert(key.clone(), bundle.clone());

        info!(
            service = %bundle.service_name,
            profile = %bundle.profile,
            version = bundle.version,
            "Config bundle changed"
        );

        let listeners: Vec<Arc<dyn ConfigListener>> = self
            .listeners
            .get(&key)
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener.on_change(bundle);
        }
        true
    }

    /// Long-poll a pair until `shutdown` fires.
    pub async fn watch(
        self: Arc<Self>,
        service_name: String,
        profile: String,
        long_poll: Duration,
        shutdown: ShutdownSignal,
    ) {
        debug!(service = %service_name, profile = %profile, "Watching config");

        loop {
            let outcome = tokio::select! {
                result = self.wait(&service_name, &profile, long_poll) => result,
                _ = shutdown.wait() => break,
            };

            if let Err(e) = outcome {
                warn!(
                    service = %service_name,
                    profile = %profile,
                    error = %e,
                    "Config poll failed"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = shutdown.wait() => break,
                }
            }
        }

        debug!(service = %service_name, profile = %profile, "Config watch stopped");
    }
}
