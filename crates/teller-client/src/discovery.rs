//! Discovery client
//!
//! Embedded in every service. Drives the instance through
//! `STARTING -> REGISTERING -> REGISTERED`, renews the lease on a schedule,
//! falls back to `STARTING` (and re-registers) when the registry forgot the
//! instance or renewals keep timing out, and deregisters on shutdown.
//!
//! Independently of renewal it keeps a cached peer list per looked-up
//! service, refreshed on a poll interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use teller_api::{InstanceRegistration, Lease, ServiceInstance};
use teller_common::{DEFAULT_LEASE_DURATION_SECS, ShutdownSignal};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use crate::transport::RegistryTransport;

/// Source of UP instances for a service.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Starting,
    Registering,
    Registered,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// What to register; `None` for a client that only discovers peers
    pub registration: Option<InstanceRegistration>,
    pub renew_interval: Duration,
    pub poll_interval: Duration,
    /// Upper bound on every registry call
    pub request_timeout: Duration,
    /// Consecutive transient renewal failures before re-registering
    pub max_renew_failures: u32,
    pub shutdown_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registration: None,
            renew_interval: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS / 3),
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(3),
            max_renew_failures: 3,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_registration(mut self, registration: InstanceRegistration) -> Self {
        // Renew three times per lease unless told otherwise
        let lease_secs = registration.lease_duration_or_default().max(1);
        self.renew_interval = Duration::from_millis(lease_secs * 1000 / 3);
        self.registration = Some(registration);
        self
    }
}

#[derive(Clone, Debug)]
struct CachedPeers {
    instances: Vec<ServiceInstance>,
    refreshed_at: Instant,
}

pub struct DiscoveryClient {
    transport: Arc<dyn RegistryTransport>,
    config: DiscoveryConfig,
    state: RwLock<ClientState>,
    lease: RwLock<Option<Lease>>,
    renew_failures: AtomicU32,
    /// Key: service name
    peers: DashMap<String, CachedPeers>,
    shutdown: ShutdownSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryClient {
    pub fn new(transport: Arc<dyn RegistryTransport>, config: DiscoveryConfig) -> Self {
        Self {
            transport,
            config,
            state: RwLock::new(ClientState::Starting),
            lease: RwLock::new(None),
            renew_failures: AtomicU32::new(0),
            peers: DashMap::new(),
            shutdown: ShutdownSignal::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    fn set_state(&self, state: ClientState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "Discovery client state change");
            *current = state;
        }
    }

    /// Id assigned by the registry, if registered.
    pub fn instance_id(&self) -> Option<String> {
        self.lease.read().as_ref().map(|l| l.instance_id.clone())
    }

    pub fn lease(&self) -> Option<Lease> {
        self.lease.read().clone()
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Register once. No-op for discovery-only clients.
    pub async fn register(&self) -> Result<()> {
        let Some(registration) = self.config.registration.as_ref() else {
            return Ok(());
        };
        if self.state() == ClientState::Stopped {
            return Ok(());
        }

        // Keep the id across re-registrations so peers see the same instance
        let mut registration = registration.clone();
        if registration.instance_id.is_none() {
            registration.instance_id = self.instance_id();
        }

        self.set_state(ClientState::Registering);
        match self.bounded(self.transport.register(&registration)).await {
            Ok(lease) => {
                info!(
                    instance_id = %lease.instance_id,
                    service = %registration.service_name,
                    expiry = lease.expiry_timestamp,
                    "Registered with registry"
                );
                *self.lease.write() = Some(lease);
                self.renew_failures.store(0, Ordering::SeqCst);
                self.set_state(ClientState::Registered);
                Ok(())
            }
            Err(e) => {
                warn!(
                    service = %registration.service_name,
                    error = %e,
                    "Registration failed"
                );
                self.set_state(ClientState::Starting);
                Err(e)
            }
        }
    }

    /// One step of the lease state machine: register when not registered,
    /// renew otherwise.
    pub async fn heartbeat(&self) -> Result<()> {
        match self.state() {
            ClientState::Stopped | ClientState::Registering => return Ok(()),
            ClientState::Starting => return self.register().await,
            ClientState::Registered => {}
        }

        let Some(instance_id) = self.instance_id() else {
            self.set_state(ClientState::Starting);
            return self.register().await;
        };

        match self.bounded(self.transport.renew(&instance_id)).await {
            Ok(lease) => {
                debug!(instance_id = %instance_id, expiry = lease.expiry_timestamp, "Lease renewed");
                *self.lease.write() = Some(lease);
                self.renew_failures.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) if e.is_unknown_instance() => {
                warn!(instance_id = %instance_id, "Registry no longer knows this instance, re-registering");
                self.set_state(ClientState::Starting);
                self.register().await
            }
            Err(e) => {
                let failures = self.renew_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    instance_id = %instance_id,
                    failures,
                    error = %e,
                    "Lease renewal failed"
                );
                if e.is_transient() && failures >= self.config.max_renew_failures {
                    warn!(instance_id = %instance_id, "Too many renewal failures, re-registering");
                    self.renew_failures.store(0, Ordering::SeqCst);
                    self.set_state(ClientState::Starting);
                    return self.register().await;
                }
                Err(e)
            }
        }
    }

    /// Cached peers of a service, without touching the registry.
    pub fn cached_instances(&self, service_name: &str) -> Option<Vec<ServiceInstance>> {
        self.peers
            .get(service_name)
            .map(|cached| cached.instances.clone())
    }

    /// Fetch the peer list of a service and update the cache.
    ///
    /// On failure the previous cached list stays in place.
    pub async fn refresh(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let instances = self.bounded(self.transport.lookup(service_name)).await?;
        self.peers.insert(
            service_name.to_string(),
            CachedPeers {
                instances: instances.clone(),
                refreshed_at: Instant::now(),
            },
        );
        Ok(instances)
    }

    /// Refresh every tracked service once.
    pub async fn refresh_all(&self) {
        let services: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        for service in services {
            if let Err(e) = self.refresh(&service).await {
                let age = self
                    .peers
                    .get(&service)
                    .map(|c| c.refreshed_at.elapsed())
                    .unwrap_or_default();
                warn!(
                    service = %service,
                    cache_age_ms = age.as_millis() as u64,
                    error = %e,
                    "Peer refresh failed, keeping cached list"
                );
            }
        }
    }

    /// Start the renewal and peer-poll loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let client = self.clone();
        tasks.push(tokio::spawn(async move { client.renew_loop().await }));

        let client = self.clone();
        tasks.push(tokio::spawn(async move { client.poll_loop().await }));
    }

    async fn renew_loop(&self) {
        if self.config.registration.is_none() {
            return;
        }

        let mut interval = tokio::time::interval(self.config.renew_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Failures are logged inside; the next tick retries
                    let _ = self.heartbeat().await;
                }
                _ = self.shutdown.wait() => break,
            }
        }
        debug!("Renewal loop stopped");
    }

    async fn poll_loop(&self) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the cache is fresh at that point
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.refresh_all().await,
                _ = self.shutdown.wait() => break,
            }
        }
        debug!("Peer poll loop stopped");
    }

    /// Stop background loops and deregister, bounded by `shutdown_timeout`.
    pub async fn shutdown(&self) {
        self.shutdown.shutdown();
        self.set_state(ClientState::Stopped);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let Some(instance_id) = self.lease.write().take().map(|l| l.instance_id) else {
            return;
        };

        match tokio::time::timeout(
            self.config.shutdown_timeout,
            self.transport.deregister(&instance_id),
        )
        .await
        {
            Ok(Ok(())) => info!(instance_id = %instance_id, "Deregistered from registry"),
            Ok(Err(e)) => error!(instance_id = %instance_id, error = %e, "Deregistration failed"),
            Err(_) => error!(instance_id = %instance_id, "Deregistration timed out"),
        }
    }
}

#[async_trait]
impl ServiceDiscovery for DiscoveryClient {
    /// Answer from the cache; fetch on a miss.
    async fn instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        if let Some(instances) = self.cached_instances(service_name) {
            return Ok(instances);
        }
        self.refresh(service_name).await
    }
}
