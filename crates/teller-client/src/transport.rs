//! Transports between the embedded clients and the registry/config server
//!
//! The HTTP transports talk to the server's REST surface. The local
//! transports call an in-process store directly, which is how the server
//! binary and the tests run the clients without a network hop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teller_api::{
    ConfigBundle, InstanceRegistration, Lease, RegisterResponse, ServiceInstance,
};
use teller_config::ConfigSnapshotProvider;
use teller_registry::RegistryStore;

use crate::error::{ClientError, Result};
use crate::http::TellerHttpClient;

/// Registry operations used by the discovery client
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn register(&self, registration: &InstanceRegistration) -> Result<Lease>;

    async fn renew(&self, instance_id: &str) -> Result<Lease>;

    async fn deregister(&self, instance_id: &str) -> Result<()>;

    /// UP instances of a service in registration order
    async fn lookup(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;
}

/// Config fetch operations used by the config client
#[async_trait]
pub trait ConfigTransport: Send + Sync {
    /// Latest bundle at or above `min_version`, waiting up to `wait` for one
    /// to be published. `Ok(None)` when none exists in time.
    async fn fetch(
        &self,
        service_name: &str,
        profile: &str,
        min_version: Option<u64>,
        wait: Option<Duration>,
    ) -> Result<Option<ConfigBundle>>;
}

pub struct HttpRegistryTransport {
    http: Arc<TellerHttpClient>,
}

impl HttpRegistryTransport {
    pub fn new(http: Arc<TellerHttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistryTransport {
    async fn register(&self, registration: &InstanceRegistration) -> Result<Lease> {
        let response: RegisterResponse = self
            .http
            .send("/v1/registry/instances", |client, url| {
                client.post(url).json(registration)
            })
            .await?;
        Ok(response.lease)
    }

    async fn renew(&self, instance_id: &str) -> Result<Lease> {
        let path = format!("/v1/registry/instances/{}/lease", instance_id);
        self.http.send(&path, |client, url| client.put(url)).await
    }

    async fn deregister(&self, instance_id: &str) -> Result<()> {
        let path = format!("/v1/registry/instances/{}", instance_id);
        let _removed: bool = self.http.send(&path, |client, url| client.delete(url)).await?;
        Ok(())
    }

    async fn lookup(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let path = format!("/v1/registry/services/{}/instances", service_name);
        self.http.send(&path, |client, url| client.get(url)).await
    }
}

pub struct HttpConfigTransport {
    http: Arc<TellerHttpClient>,
}

impl HttpConfigTransport {
    pub fn new(http: Arc<TellerHttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ConfigTransport for HttpConfigTransport {
    async fn fetch(
        &self,
        service_name: &str,
        profile: &str,
        min_version: Option<u64>,
        wait: Option<Duration>,
    ) -> Result<Option<ConfigBundle>> {
        let path = format!("/v1/config/bundles/{}/{}", service_name, profile);

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(min_version) = min_version {
            query.push(("minVersion", min_version.to_string()));
        }
        if let Some(wait) = wait {
            query.push(("waitMs", wait.as_millis().to_string()));
        }

        let result: Result<ConfigBundle> = self
            .http
            .send(&path, |client, url| client.get(url).query(&query))
            .await;
        match result {
            Ok(bundle) => Ok(Some(bundle)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// In-process registry access
pub struct LocalRegistryTransport {
    store: Arc<RegistryStore>,
}

impl LocalRegistryTransport {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RegistryTransport for LocalRegistryTransport {
    async fn register(&self, registration: &InstanceRegistration) -> Result<Lease> {
        let lease_secs = registration.lease_duration_or_default();
        Ok(self.store.register(registration.clone(), lease_secs)?)
    }

    async fn renew(&self, instance_id: &str) -> Result<Lease> {
        Ok(self.store.renew(instance_id)?)
    }

    async fn deregister(&self, instance_id: &str) -> Result<()> {
        self.store.deregister(instance_id);
        Ok(())
    }

    async fn lookup(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self.store.lookup(service_name))
    }
}

/// In-process config access
pub struct LocalConfigTransport {
    provider: Arc<ConfigSnapshotProvider>,
}

impl LocalConfigTransport {
    pub fn new(provider: Arc<ConfigSnapshotProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ConfigTransport for LocalConfigTransport {
    async fn fetch(
        &self,
        service_name: &str,
        profile: &str,
        min_version: Option<u64>,
        wait: Option<Duration>,
    ) -> Result<Option<ConfigBundle>> {
        let result = match wait {
            Some(wait) if !wait.is_zero() => {
                self.provider
                    .wait_for(service_name, profile, min_version, wait)
                    .await
            }
            _ => self.provider.fetch(service_name, profile, min_version).await,
        };

        match result {
            Ok(bundle) => Ok(Some(bundle.as_ref().clone())),
            Err(e) => {
                let err = ClientError::from(e);
                if err.is_not_found() { Ok(None) } else { Err(err) }
            }
        }
    }
}
