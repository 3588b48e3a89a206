//! Config snapshot provider
//!
//! Keeps the version history of every (serviceName, profile) pair. Each pair
//! has its own async `RwLock`, so publishing to one pair never blocks readers
//! or writers of another. Versions are immutable and strictly increasing.
//! Consumers poll [`ConfigSnapshotProvider::fetch`] or long-poll
//! [`ConfigSnapshotProvider::wait_for`]; nothing is pushed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use teller_api::{ConfigBundle, bundle_key};
use teller_common::{Clock, SystemClock, TellerError};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::persistence::{BundleStore, MemoryBundleStore};

struct BundleSlot {
    versions: RwLock<BTreeMap<u64, Arc<ConfigBundle>>>,
    /// Latest published version, 0 when nothing was published yet
    latest: watch::Sender<u64>,
}

impl BundleSlot {
    fn new() -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            versions: RwLock::new(BTreeMap::new()),
            latest,
        }
    }
}

pub struct ConfigSnapshotProvider {
    /// Key: serviceName@@profile
    slots: DashMap<String, Arc<BundleSlot>>,
    store: Arc<dyn BundleStore>,
    clock: Arc<dyn Clock>,
}

impl ConfigSnapshotProvider {
    pub fn new(store: Arc<dyn BundleStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn BundleStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            store,
            clock,
        }
    }

    /// Provider backed by a volatile store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBundleStore::new()))
    }

    fn slot(&self, service_name: &str, profile: &str) -> Arc<BundleSlot> {
        self.slots
            .entry(bundle_key(service_name, profile))
            .or_insert_with(|| Arc::new(BundleSlot::new()))
            .clone()
    }

    fn existing_slot(&self, service_name: &str, profile: &str) -> Option<Arc<BundleSlot>> {
        self.slots
            .get(&bundle_key(service_name, profile))
            .map(|slot| slot.clone())
    }

    /// Drop a slot that only a long-poll ever created. Anyone about to use it
    /// holds an `Arc` or a receiver, which keeps it in place.
    fn release_idle_slot(&self, service_name: &str, profile: &str) {
        self.slots.remove_if(&bundle_key(service_name, profile), |_, slot| {
            Arc::strong_count(slot) == 1
                && slot.latest.receiver_count() == 0
                && slot
                    .versions
                    .try_read()
                    .map(|versions| versions.is_empty())
                    .unwrap_or(false)
        });
    }

    /// Reload every persisted bundle. Returns the number of versions loaded.
    pub async fn restore(&self) -> teller_common::Result<usize> {
        let bundles = self
            .store
            .load_all()
            .await
            .map_err(|e| TellerError::Storage(e.to_string()))?;
        let count = bundles.len();

        for bundle in bundles {
            let slot = self.slot(&bundle.service_name, &bundle.profile);
            let mut versions = slot.versions.write().await;
            let version = bundle.version;
            versions.insert(version, Arc::new(bundle));
            if let Some(latest) = versions.keys().next_back() {
                slot.latest.send_replace(*latest);
            }
        }

        info!(versions = count, "Restored config bundles");
        Ok(count)
    }

    /// Append a new version.
    ///
    /// Fails with `StaleVersion` unless the version is strictly greater
    /// than the current one. The bundle is persisted before it becomes
    /// visible to `fetch`.
    pub async fn publish(&self, mut bundle: ConfigBundle) -> teller_common::Result<Arc<ConfigBundle>> {
        bundle.validate()?;

        let slot = self.slot(&bundle.service_name, &bundle.profile);
        let mut versions = slot.versions.write().await;

        let current = versions.keys().next_back().copied().unwrap_or(0);
        if bundle.version <= current {
            return Err(TellerError::StaleVersion {
                service: bundle.service_name,
                profile: bundle.profile,
                version: bundle.version,
                current,
            });
        }

        if bundle.published_at == 0 {
            bundle.published_at = self.clock.now_millis();
        }

        self.store
            .save(&bundle)
            .await
            .map_err(|e| TellerError::Storage(e.to_string()))?;

        let bundle = Arc::new(bundle);
        versions.insert(bundle.version, bundle.clone());
        slot.latest.send_replace(bundle.version);
        drop(versions);

        info!(
            service = %bundle.service_name,
            profile = %bundle.profile,
            version = bundle.version,
            properties = bundle.properties.len(),
            "Published config bundle"
        );
        Ok(bundle)
    }

    /// Latest version, provided it is at least `min_version`.
    pub async fn fetch(
        &self,
        service_name: &str,
        profile: &str,
        min_version: Option<u64>,
    ) -> teller_common::Result<Arc<ConfigBundle>> {
        let not_found = || {
            TellerError::NotFound(format!(
                "no config bundle for {}/{} at version >= {}",
                service_name,
                profile,
                min_version.unwrap_or(1)
            ))
        };

        let slot = self
            .existing_slot(service_name, profile)
            .ok_or_else(not_found)?;
        let versions = slot.versions.read().await;

        match versions.values().next_back() {
            Some(latest) if latest.version >= min_version.unwrap_or(0) => Ok(latest.clone()),
            _ => Err(not_found()),
        }
    }

    /// One exact historic version.
    pub async fn fetch_version(
        &self,
        service_name: &str,
        profile: &str,
        version: u64,
    ) -> teller_common::Result<Arc<ConfigBundle>> {
        let not_found = || {
            TellerError::NotFound(format!(
                "config bundle {}/{} version {} not found",
                service_name, profile, version
            ))
        };

        let slot = self
            .existing_slot(service_name, profile)
            .ok_or_else(not_found)?;
        let versions = slot.versions.read().await;
        versions.get(&version).cloned().ok_or_else(not_found)
    }

    /// Long-poll variant of [`fetch`](Self::fetch).
    ///
    /// Resolves as soon as a version `>= min_version` exists, or fails with
    /// `NotFound` once `timeout` elapses.
    pub async fn wait_for(
        &self,
        service_name: &str,
        profile: &str,
        min_version: Option<u64>,
        timeout: Duration,
    ) -> teller_common::Result<Arc<ConfigBundle>> {
        let wanted = min_version.unwrap_or(1).max(1);
        let mut latest = self.slot(service_name, profile).latest.subscribe();

        let arrived = matches!(
            tokio::time::timeout(timeout, latest.wait_for(|v| *v >= wanted)).await,
            Ok(Ok(_))
        );
        if !arrived {
            debug!(
                service = %service_name,
                profile = %profile,
                min_version = wanted,
                "Config long-poll timed out"
            );
            drop(latest);
            self.release_idle_slot(service_name, profile);
        }

        // A publish may have landed right at the deadline
        self.fetch(service_name, profile, min_version).await
    }

    /// Retained versions in ascending order.
    pub async fn versions(&self, service_name: &str, profile: &str) -> Vec<u64> {
        match self.existing_slot(service_name, profile) {
            Some(slot) => slot.versions.read().await.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Known (serviceName, profile) pairs that hold at least one version.
    pub async fn keys(&self) -> Vec<(String, String)> {
        let slots: Vec<Arc<BundleSlot>> = self.slots.iter().map(|e| e.value().clone()).collect();

        let mut keys = Vec::new();
        for slot in slots {
            let versions = slot.versions.read().await;
            if let Some(bundle) = versions.values().next_back() {
                keys.push((bundle.service_name.clone(), bundle.profile.clone()));
            }
        }
        keys.sort();
        keys
    }

    /// Drop old versions of one pair.
    ///
    /// The newest `keep_latest` versions (at least one) and every version in
    /// `referenced` survive. Returns the removed versions.
    pub async fn compact(
        &self,
        service_name: &str,
        profile: &str,
        keep_latest: usize,
        referenced: &HashSet<u64>,
    ) -> teller_common::Result<Vec<u64>> {
        let Some(slot) = self.existing_slot(service_name, profile) else {
            return Ok(Vec::new());
        };
        let mut versions = slot.versions.write().await;

        let keep_latest = keep_latest.max(1);
        let candidates: Vec<u64> = versions
            .keys()
            .rev()
            .skip(keep_latest)
            .filter(|v| !referenced.contains(*v))
            .copied()
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for version in candidates {
            if let Err(e) = self.store.remove(service_name, profile, version).await {
                warn!(
                    service = %service_name,
                    profile = %profile,
                    version,
                    error = %e,
                    "Failed to remove config bundle from store, keeping it"
                );
                continue;
            }
            versions.remove(&version);
            removed.push(version);
        }
        removed.sort_unstable();

        if !removed.is_empty() {
            info!(
                service = %service_name,
                profile = %profile,
                removed = ?removed,
                "Compacted config bundle history"
            );
        }
        Ok(removed)
    }
}
