//! Bundle persistence
//!
//! The provider writes every published version through a [`BundleStore`]
//! before it becomes visible, and reloads all of them on start-up.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use teller_api::{ConfigBundle, bundle_key};
use tracing::{debug, warn};

/// Durable storage for published bundles
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Persist one bundle version
    async fn save(&self, bundle: &ConfigBundle) -> anyhow::Result<()>;

    /// Remove one bundle version; removing an absent version is not an error
    async fn remove(&self, service_name: &str, profile: &str, version: u64) -> anyhow::Result<()>;

    /// Load every stored bundle version
    async fn load_all(&self) -> anyhow::Result<Vec<ConfigBundle>>;
}

/// Volatile store, for tests and single-process setups
#[derive(Debug, Default)]
pub struct MemoryBundleStore {
    /// Key: serviceName@@profile@@version
    bundles: DashMap<String, ConfigBundle>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_key(service_name: &str, profile: &str, version: u64) -> String {
        format!("{}@@{}", bundle_key(service_name, profile), version)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn save(&self, bundle: &ConfigBundle) -> anyhow::Result<()> {
        self.bundles.insert(
            Self::entry_key(&bundle.service_name, &bundle.profile, bundle.version),
            bundle.clone(),
        );
        Ok(())
    }

    async fn remove(&self, service_name: &str, profile: &str, version: u64) -> anyhow::Result<()> {
        self.bundles
            .remove(&Self::entry_key(service_name, profile, version));
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<ConfigBundle>> {
        Ok(self.bundles.iter().map(|e| e.value().clone()).collect())
    }
}

/// One JSON file per version: `<dir>/<service>@@<profile>/<version>.json`
#[derive(Debug, Clone)]
pub struct FileBundleStore {
    root: PathBuf,
}

impl FileBundleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one (service, profile) pair; always a direct child of
    /// `root`.
    fn bundle_dir(&self, service_name: &str, profile: &str) -> anyhow::Result<PathBuf> {
        let key = bundle_key(service_name, profile);
        let mut components = Path::new(&key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(key)),
            _ => anyhow::bail!("bundle key {key:?} is not a plain directory name"),
        }
    }

    fn bundle_path(&self, service_name: &str, profile: &str, version: u64) -> anyhow::Result<PathBuf> {
        Ok(self
            .bundle_dir(service_name, profile)?
            .join(format!("{}.json", version)))
    }
}

#[async_trait]
impl BundleStore for FileBundleStore {
    async fn save(&self, bundle: &ConfigBundle) -> anyhow::Result<()> {
        let dir = self.bundle_dir(&bundle.service_name, &bundle.profile)?;
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.bundle_path(&bundle.service_name, &bundle.profile, bundle.version)?;
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(bundle)?;

        // Write then rename so a crash never leaves a truncated version behind
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "Saved config bundle");
        Ok(())
    }

    async fn remove(&self, service_name: &str, profile: &str, version: u64) -> anyhow::Result<()> {
        let path = self.bundle_path(service_name, profile, version)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> anyhow::Result<Vec<ConfigBundle>> {
        let mut bundles = Vec::new();

        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(bundles),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }

            let mut files = tokio::fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }

                let content = tokio::fs::read(&path).await?;
                match serde_json::from_slice::<ConfigBundle>(&content) {
                    Ok(bundle) => bundles.push(bundle),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable config bundle");
                    }
                }
            }
        }

        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(version: u64) -> ConfigBundle {
        ConfigBundle::new("customer", "prod", version).with_property("db.url", "jdbc://db")
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBundleStore::new();
        store.save(&bundle(1)).await.unwrap();
        store.save(&bundle(2)).await.unwrap();
        assert_eq!(store.len(), 2);

        store.remove("customer", "prod", 1).await.unwrap();
        store.remove("customer", "prod", 9).await.unwrap();
        let all = store.load_all().await.unwrap();
        assert_eq!(all, vec![bundle(2)]);
    }

    #[tokio::test]
    async fn test_file_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBundleStore::new(dir.path());
        store.save(&bundle(3)).await.unwrap();

        let expected = dir.path().join("customer@@prod").join("3.json");
        assert!(expected.exists());
        assert!(!dir.path().join("customer@@prod").join("3.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_load_all_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBundleStore::new(dir.path());
        store.save(&bundle(1)).await.unwrap();
        store.save(&bundle(2)).await.unwrap();
        store
            .save(&ConfigBundle::new("card", "dev", 5))
            .await
            .unwrap();

        store.remove("customer", "prod", 1).await.unwrap();
        // Second removal is a no-op
        store.remove("customer", "prod", 1).await.unwrap();

        let mut all = store.load_all().await.unwrap();
        all.sort_by_key(|b| b.version);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], bundle(2));
        assert_eq!(all[1].service_name, "card");
    }

    #[tokio::test]
    async fn test_file_store_refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let store = FileBundleStore::new(&root);

        let escaping = ConfigBundle::new("svc", "x/../../escaped", 1);
        assert!(store.save(&escaping).await.is_err());
        assert!(store.remove("svc", "x/../../escaped", 1).await.is_err());
        assert!(!dir.path().join("escaped").exists());
        assert!(!dir.path().join("escaped").join("1.json").exists());

        // Separators alone are enough to leave a single directory level
        assert!(store.save(&ConfigBundle::new("a/b", "prod", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBundleStore::new(dir.path().join("never-created"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBundleStore::new(dir.path());
        store.save(&bundle(1)).await.unwrap();
        std::fs::write(dir.path().join("customer@@prod").join("2.json"), b"{not json").unwrap();

        assert_eq!(store.load_all().await.unwrap(), vec![bundle(1)]);
    }
}
