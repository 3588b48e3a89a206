//! Periodic pruning of config bundle history.
//!
//! Versions reported by registered instances through the `config.version`
//! metadata key are never removed. An instance that also reports
//! `config.profile` pins the version for that profile only; otherwise the
//! version is pinned for every profile of its service.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use teller_common::{CONFIG_PROFILE_METADATA_KEY, CONFIG_VERSION_METADATA_KEY, ShutdownSignal};
use teller_config::ConfigSnapshotProvider;
use teller_registry::RegistryStore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Newest versions kept per (service, profile)
    pub keep_latest: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            keep_latest: 5,
        }
    }
}

/// Versions in use, keyed by service then profile (`None` = any profile).
#[derive(Debug, Default)]
struct ReferencedVersions {
    by_service: HashMap<String, HashMap<Option<String>, HashSet<u64>>>,
}

impl ReferencedVersions {
    fn collect(registry: &RegistryStore) -> Self {
        let mut referenced = Self::default();
        for summary in registry.services() {
            for instance in registry.lookup_all(&summary.name) {
                let Some(version) = instance
                    .metadata
                    .get(CONFIG_VERSION_METADATA_KEY)
                    .and_then(|v| v.trim().parse::<u64>().ok())
                else {
                    continue;
                };
                let profile = instance.metadata.get(CONFIG_PROFILE_METADATA_KEY).cloned();
                referenced
                    .by_service
                    .entry(instance.service_name.clone())
                    .or_default()
                    .entry(profile)
                    .or_default()
                    .insert(version);
            }
        }
        referenced
    }

    fn for_key(&self, service_name: &str, profile: &str) -> HashSet<u64> {
        let Some(profiles) = self.by_service.get(service_name) else {
            return HashSet::new();
        };
        let mut versions = HashSet::new();
        if let Some(any) = profiles.get(&None) {
            versions.extend(any);
        }
        if let Some(exact) = profiles.get(&Some(profile.to_string())) {
            versions.extend(exact);
        }
        versions
    }
}

pub struct CompactionTask {
    registry: Arc<RegistryStore>,
    provider: Arc<ConfigSnapshotProvider>,
    config: CompactionConfig,
}

impl CompactionTask {
    pub fn new(
        registry: Arc<RegistryStore>,
        provider: Arc<ConfigSnapshotProvider>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            config,
        }
    }

    /// One pass over every known (service, profile). Returns the number of
    /// removed versions.
    pub async fn compact_once(&self) -> usize {
        let referenced = ReferencedVersions::collect(&self.registry);
        let mut removed = 0;

        for (service_name, profile) in self.provider.keys().await {
            let pinned = referenced.for_key(&service_name, &profile);
            match self
                .provider
                .compact(&service_name, &profile, self.config.keep_latest, &pinned)
                .await
            {
                Ok(versions) => removed += versions.len(),
                Err(e) => warn!(
                    service = %service_name,
                    profile = %profile,
                    error = %e,
                    "Config compaction failed"
                ),
            }
        }

        debug!(removed, "Config compaction pass finished");
        removed
    }

    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        if !self.config.enabled {
            info!("Config compaction disabled");
            return;
        }

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            keep_latest = self.config.keep_latest,
            "Starting config compaction task"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.compact_once().await;
                }
                _ = shutdown.wait() => {
                    break;
                }
            }
        }

        info!("Config compaction task stopped");
    }
}

#[cfg(test)]
mod tests {
    use teller_api::{ConfigBundle, InstanceRegistration};

    use super::*;

    async fn publish_versions(provider: &ConfigSnapshotProvider, service: &str, profile: &str, upto: u64) {
        for version in 1..=upto {
            provider
                .publish(ConfigBundle::new(service, profile, version))
                .await
                .unwrap();
        }
    }

    fn register_with_metadata(registry: &RegistryStore, service: &str, port: u16, meta: &[(&str, &str)]) {
        let mut registration = InstanceRegistration::new(service, "10.0.0.1", port);
        for (k, v) in meta {
            registration.metadata.insert(k.to_string(), v.to_string());
        }
        registry.register(registration, 30).unwrap();
    }

    #[tokio::test]
    async fn test_compaction_keeps_latest_and_referenced() {
        let registry = Arc::new(RegistryStore::new());
        let provider = Arc::new(ConfigSnapshotProvider::in_memory());
        publish_versions(&provider, "orders", "prod", 6).await;
        register_with_metadata(
            &registry,
            "orders",
            8080,
            &[(CONFIG_VERSION_METADATA_KEY, "2"), (CONFIG_PROFILE_METADATA_KEY, "prod")],
        );

        let task = CompactionTask::new(
            registry,
            provider.clone(),
            CompactionConfig {
                keep_latest: 2,
                ..Default::default()
            },
        );

        assert_eq!(task.compact_once().await, 3);
        assert_eq!(provider.versions("orders", "prod").await, vec![2, 5, 6]);
        assert_eq!(task.compact_once().await, 0);
    }

    #[tokio::test]
    async fn test_reference_without_profile_pins_every_profile() {
        let registry = Arc::new(RegistryStore::new());
        let provider = Arc::new(ConfigSnapshotProvider::in_memory());
        publish_versions(&provider, "orders", "prod", 3).await;
        publish_versions(&provider, "orders", "staging", 3).await;
        publish_versions(&provider, "billing", "prod", 3).await;
        register_with_metadata(&registry, "orders", 8080, &[(CONFIG_VERSION_METADATA_KEY, "1")]);
        // Unparseable versions are ignored
        register_with_metadata(&registry, "billing", 8081, &[(CONFIG_VERSION_METADATA_KEY, "v1")]);

        let task = CompactionTask::new(
            registry,
            provider.clone(),
            CompactionConfig {
                keep_latest: 1,
                ..Default::default()
            },
        );
        task.compact_once().await;

        assert_eq!(provider.versions("orders", "prod").await, vec![1, 3]);
        assert_eq!(provider.versions("orders", "staging").await, vec![1, 3]);
        assert_eq!(provider.versions("billing", "prod").await, vec![3]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let task = Arc::new(CompactionTask::new(
            Arc::new(RegistryStore::new()),
            Arc::new(ConfigSnapshotProvider::in_memory()),
            CompactionConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(task.run(shutdown.clone()));

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task did not stop")
            .unwrap();
    }
}
