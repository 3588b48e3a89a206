//! In-memory registry store
//!
//! Instances are keyed by instance id. Two secondary indexes are kept:
//! a per-service index ordered by registration sequence (stable order for
//! round-robin consumers) and an address index `service#host#port` used for
//! duplicate detection. Each map is sharded by `DashMap`, so mutations of
//! different instances never contend on a single lock.
//!
//! Lock order is addresses -> instances -> services. No code path holds a
//! guard on a later map while acquiring an earlier one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use teller_api::{
    InstanceRegistration, InstanceStatus, Lease, ServiceInstance, ServiceSummary,
};
use teller_common::{Clock, MAX_LEASE_DURATION_SECS, SystemClock, TellerError};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::event::RegistryEvent;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct InstanceRecord {
    instance: ServiceInstance,
    lease: Lease,
    sequence: u64,
    address_key: String,
}

/// Owned, internally synchronized registry of service instances.
pub struct RegistryStore {
    clock: Arc<dyn Clock>,
    /// Key: instance id
    instances: DashMap<String, InstanceRecord>,
    /// Key: service name, Value: registration sequence -> instance id
    services: DashMap<String, BTreeMap<u64, String>>,
    /// Key: service#host#port, Value: instance id
    addresses: DashMap<String, String>,
    /// Logical clock; every committed mutation takes one tick
    tick: AtomicU64,
    /// Serializes registrations from check to commit
    register_lock: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
}

impl RegistryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            clock,
            instances: DashMap::new(),
            services: DashMap::new(),
            addresses: DashMap::new(),
            tick: AtomicU64::new(0),
            register_lock: Mutex::new(()),
            events,
        }
    }

    /// Subscribe to registry change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Current logical clock value.
    pub fn revision(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register an instance and hand out its lease.
    ///
    /// Fails with `DuplicateInstance` when the same service/host/port is
    /// already held by another UP instance. A non-UP holder of the address is
    /// replaced. Registering an id again at the address it holds refreshes it
    /// in place.
    pub fn register(
        &self,
        registration: InstanceRegistration,
        lease_duration_secs: u64,
    ) -> teller_common::Result<Lease> {
        registration.validate()?;
        if lease_duration_secs == 0 {
            return Err(TellerError::IllegalArgument(
                "lease duration must be greater than 0".to_string(),
            ));
        }
        if lease_duration_secs > MAX_LEASE_DURATION_SECS {
            return Err(TellerError::IllegalArgument(format!(
                "lease duration must not exceed {MAX_LEASE_DURATION_SECS} seconds"
            )));
        }

        // Held until commit: two requests for the same id must not both pass the checks below
        let _commit = self.register_lock.lock();

        // A caller-supplied id must not silently take over another live record
        if let Some(requested_id) = registration.instance_id.as_deref() {
            let existing = self
                .instances
                .get(requested_id)
                .map(|rec| (rec.instance.is_up(), rec.address_key.clone(), rec.instance.clone()));
            if let Some((is_up, address_key, instance)) = existing {
                if is_up && address_key != registration.address_key() {
                    return Err(TellerError::DuplicateInstance {
                        service: instance.service_name,
                        host: instance.host_address,
                        port: instance.port,
                    });
                }
                if !is_up && address_key != registration.address_key() {
                    self.deregister(requested_id);
                }
            }
        }

        let address_key = registration.address_key();
        let instance_id = registration
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = self.clock.now_millis();

        let mut replaced = None;
        let record = match self.addresses.entry(address_key.clone()) {
            Entry::Occupied(mut occupied) => {
                let holder_id = occupied.get().clone();
                if holder_id == instance_id {
                    if let Some((instance, previous, lease)) =
                        self.refresh_record(&registration, &instance_id, now, lease_duration_secs)
                    {
                        drop(occupied);
                        self.next_tick();
                        info!(
                            instance_id = %instance_id,
                            service = %instance.service_name,
                            lease_secs = lease_duration_secs,
                            "Refreshed existing registration"
                        );
                        if previous != instance.status {
                            self.publish(RegistryEvent::StatusChanged { instance, previous });
                        }
                        return Ok(lease);
                    }
                }
                let holder_up = self
                    .instances
                    .get(&holder_id)
                    .map(|rec| rec.instance.is_up())
                    .unwrap_or(false);
                if holder_up {
                    return Err(TellerError::DuplicateInstance {
                        service: registration.service_name,
                        host: registration.host_address,
                        port: registration.port,
                    });
                }
                replaced = self.remove_record(&holder_id);
                let record = self.insert_record(&registration, &instance_id, &address_key, now, lease_duration_secs);
                occupied.insert(instance_id.clone());
                record
            }
            Entry::Vacant(vacant) => {
                let record = self.insert_record(&registration, &instance_id, &address_key, now, lease_duration_secs);
                vacant.insert(instance_id.clone());
                record
            }
        };

        if let Some(old) = replaced {
            debug!(
                instance_id = %old.instance.instance_id,
                service = %old.instance.service_name,
                "Replaced stale registration at the same address"
            );
            self.publish(RegistryEvent::Deregistered(old.instance));
        }

        info!(
            instance_id = %instance_id,
            service = %record.instance.service_name,
            address = %record.instance.authority(),
            lease_secs = lease_duration_secs,
            "Registered instance"
        );
        self.publish(RegistryEvent::Registered(record.instance.clone()));

        Ok(record.lease)
    }

    /// Re-registration of an id at the address it already holds: metadata,
    /// status and lease are refreshed, the registration sequence is kept.
    fn refresh_record(
        &self,
        registration: &InstanceRegistration,
        instance_id: &str,
        now: i64,
        lease_duration_secs: u64,
    ) -> Option<(ServiceInstance, InstanceStatus, Lease)> {
        let mut record = self.instances.get_mut(instance_id)?;
        let previous = record.instance.status;
        record.instance.metadata = registration.metadata.clone();
        record.instance.status = registration.status.unwrap_or(InstanceStatus::Up);
        record.instance.last_renewal_timestamp = now;
        record.lease = Lease::new(instance_id, lease_duration_secs, now);
        Some((record.instance.clone(), previous, record.lease.clone()))
    }

    fn insert_record(
        &self,
        registration: &InstanceRegistration,
        instance_id: &str,
        address_key: &str,
        now: i64,
        lease_duration_secs: u64,
    ) -> InstanceRecord {
        let sequence = self.next_tick();
        let instance = ServiceInstance {
            service_name: registration.service_name.clone(),
            instance_id: instance_id.to_string(),
            host_address: registration.host_address.clone(),
            port: registration.port,
            metadata: registration.metadata.clone(),
            status: registration.status.unwrap_or(InstanceStatus::Up),
            last_renewal_timestamp: now,
            registration_timestamp: now,
        };
        let record = InstanceRecord {
            lease: Lease::new(instance_id, lease_duration_secs, now),
            instance,
            sequence,
            address_key: address_key.to_string(),
        };

        self.instances
            .insert(instance_id.to_string(), record.clone());
        self.services
            .entry(registration.service_name.clone())
            .or_default()
            .insert(sequence, instance_id.to_string());

        record
    }

    /// Remove an instance record and its service index entry.
    /// The address index is left to the caller.
    fn remove_record(&self, instance_id: &str) -> Option<InstanceRecord> {
        let (_, record) = self.instances.remove(instance_id)?;
        self.unindex_service(&record);
        Some(record)
    }

    fn unindex_service(&self, record: &InstanceRecord) {
        let service = &record.instance.service_name;
        if let Some(mut index) = self.services.get_mut(service) {
            index.remove(&record.sequence);
        }
        self.services.remove_if(service, |_, index| index.is_empty());
    }

    /// Renew the lease of a registered instance.
    ///
    /// An instance that was marked DOWN because its lease expired comes back
    /// UP: the renewal is proof of life.
    pub fn renew(&self, instance_id: &str) -> teller_common::Result<Lease> {
        let now = self.clock.now_millis();
        let mut record = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| TellerError::UnknownInstance(instance_id.to_string()))?;

        record.instance.last_renewal_timestamp = now;
        record.lease = Lease::new(instance_id, record.lease.duration_secs, now);
        let restored = record.instance.status == InstanceStatus::Down;
        if restored {
            record.instance.status = InstanceStatus::Up;
        }
        let lease = record.lease.clone();
        let instance = record.instance.clone();
        drop(record);
        self.next_tick();

        if restored {
            info!(
                instance_id = %instance_id,
                service = %instance.service_name,
                "Renewal restored evicted instance"
            );
            self.publish(RegistryEvent::StatusChanged {
                instance,
                previous: InstanceStatus::Down,
            });
        }

        Ok(lease)
    }

    /// Override the status of an instance (e.g. OUT_OF_SERVICE for draining).
    pub fn set_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> teller_common::Result<ServiceInstance> {
        let mut record = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| TellerError::UnknownInstance(instance_id.to_string()))?;
        let previous = record.instance.status;
        record.instance.status = status;
        let instance = record.instance.clone();
        drop(record);
        self.next_tick();

        if previous != status {
            info!(
                instance_id = %instance_id,
                from = %previous,
                to = %status,
                "Instance status changed"
            );
            self.publish(RegistryEvent::StatusChanged {
                instance: instance.clone(),
                previous,
            });
        }
        Ok(instance)
    }

    /// Remove an instance. Absent instances are not an error.
    ///
    /// Returns whether a record was removed.
    pub fn deregister(&self, instance_id: &str) -> bool {
        let Some(address_key) = self
            .instances
            .get(instance_id)
            .map(|rec| rec.address_key.clone())
        else {
            debug!(instance_id = %instance_id, "Deregister of unknown instance ignored");
            return false;
        };

        self.addresses
            .remove_if(&address_key, |_, holder| holder == instance_id);

        match self.remove_record(instance_id) {
            Some(record) => {
                self.next_tick();
                info!(
                    instance_id = %instance_id,
                    service = %record.instance.service_name,
                    "Deregistered instance"
                );
                self.publish(RegistryEvent::Deregistered(record.instance));
                true
            }
            None => false,
        }
    }

    /// UP instances of a service in registration order.
    pub fn lookup(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.collect_instances(service_name, |instance| instance.is_up())
    }

    /// Every instance of a service regardless of status, in registration order.
    pub fn lookup_all(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.collect_instances(service_name, |_| true)
    }

    fn collect_instances<F>(&self, service_name: &str, filter: F) -> Vec<ServiceInstance>
    where
        F: Fn(&ServiceInstance) -> bool,
    {
        let ids: Vec<String> = match self.services.get(service_name) {
            Some(index) => index.values().cloned().collect(),
            None => return Vec::new(),
        };

        ids.iter()
            .filter_map(|id| self.instances.get(id).map(|rec| rec.instance.clone()))
            .filter(|instance| filter(instance))
            .collect()
    }

    /// Get a single instance by id.
    pub fn instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.instances
            .get(instance_id)
            .map(|rec| rec.instance.clone())
    }

    /// Get the current lease of an instance.
    pub fn lease(&self, instance_id: &str) -> Option<Lease> {
        self.instances.get(instance_id).map(|rec| rec.lease.clone())
    }

    /// List services with their instance counts, sorted by name.
    pub fn services(&self) -> Vec<ServiceSummary> {
        let names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        let mut summaries: Vec<ServiceSummary> = names
            .into_iter()
            .map(|name| {
                let all = self.lookup_all(&name);
                ServiceSummary {
                    up_count: all.iter().filter(|i| i.is_up()).count(),
                    instance_count: all.len(),
                    name,
                }
            })
            .filter(|s| s.instance_count > 0)
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Total number of instance records.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Ids of instances that are not DOWN and whose lease expired before `now`.
    pub(crate) fn expired_candidates(&self, now: i64) -> Vec<String> {
        self.instances
            .iter()
            .filter(|entry| {
                entry.instance.status != InstanceStatus::Down && entry.lease.is_expired(now)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Ids of DOWN instances whose lease expired more than `grace_ms` before `now`.
    pub(crate) fn purge_candidates(&self, now: i64, grace_ms: i64) -> Vec<String> {
        self.instances
            .iter()
            .filter(|entry| {
                entry.instance.status == InstanceStatus::Down
                    && entry.lease.expiry_timestamp + grace_ms < now
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Commit an eviction decided by a sweep that started at `check_started`.
    ///
    /// The expiry is re-evaluated under the instance's lock against the
    /// record as it is now, so a renewal that committed after the sweep
    /// began is never overwritten.
    pub(crate) fn evict_if_expired(
        &self,
        instance_id: &str,
        check_started: i64,
    ) -> Option<ServiceInstance> {
        let mut record = self.instances.get_mut(instance_id)?;
        if record.instance.status == InstanceStatus::Down
            || !record.lease.is_expired(check_started)
        {
            return None;
        }
        record.instance.status = InstanceStatus::Down;
        let instance = record.instance.clone();
        drop(record);
        self.next_tick();

        self.publish(RegistryEvent::Evicted(instance.clone()));
        Some(instance)
    }

    /// Remove a DOWN instance whose lease stayed expired past the grace period.
    pub(crate) fn purge_if_stale(
        &self,
        instance_id: &str,
        now: i64,
        grace_ms: i64,
    ) -> Option<ServiceInstance> {
        let (_, record) = self.instances.remove_if(instance_id, |_, rec| {
            rec.instance.status == InstanceStatus::Down
                && rec.lease.expiry_timestamp + grace_ms < now
        })?;
        self.addresses
            .remove_if(&record.address_key, |_, holder| holder == instance_id);
        self.unindex_service(&record);
        self.next_tick();

        self.publish(RegistryEvent::Purged(record.instance.clone()));
        Some(record.instance)
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use teller_common::ManualClock;

    use super::*;

    fn store_with_clock() -> (RegistryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (RegistryStore::with_clock(clock.clone()), clock)
    }

    fn registration(service: &str, host: &str, port: u16) -> InstanceRegistration {
        InstanceRegistration::new(service, host, port)
    }

    #[test]
    fn test_register_and_lookup() {
        let (store, _) = store_with_clock();
        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();

        let instances = store.lookup("card");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id, lease.instance_id);
        assert_eq!(instances[0].status, InstanceStatus::Up);
        assert_eq!(lease.expiry_timestamp, 1_000_000 + 30_000);
    }

    #[test]
    fn test_register_duplicate_up_address_fails() {
        let (store, _) = store_with_clock();
        store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();

        let err = store
            .register(registration("card", "10.0.0.1", 8080), 30)
            .unwrap_err();
        assert!(matches!(err, TellerError::DuplicateInstance { port: 8080, .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_same_address_different_service_is_not_duplicate() {
        let (store, _) = store_with_clock();
        store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        assert!(store.register(registration("customer", "10.0.0.1", 8080), 30).is_ok());
    }

    #[test]
    fn test_register_replaces_down_holder() {
        let (store, _) = store_with_clock();
        let old = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        store.set_status(&old.instance_id, InstanceStatus::Down).unwrap();

        let new = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        assert_ne!(old.instance_id, new.instance_id);
        assert!(store.instance(&old.instance_id).is_none());
        assert_eq!(store.lookup("card").len(), 1);
    }

    #[test]
    fn test_register_with_requested_id() {
        let (store, _) = store_with_clock();
        let lease = store
            .register(registration("card", "10.0.0.1", 8080).with_instance_id("card-1"), 30)
            .unwrap();
        assert_eq!(lease.instance_id, "card-1");

        // Same id at another address while UP is a conflict
        let err = store
            .register(registration("card", "10.0.0.2", 8080).with_instance_id("card-1"), 30)
            .unwrap_err();
        assert!(matches!(err, TellerError::DuplicateInstance { .. }));
    }

    #[test]
    fn test_register_rejects_zero_lease() {
        let (store, _) = store_with_clock();
        let err = store
            .register(registration("card", "10.0.0.1", 8080), 0)
            .unwrap_err();
        assert!(matches!(err, TellerError::IllegalArgument(_)));
    }

    #[test]
    fn test_register_rejects_oversized_lease() {
        let (store, _) = store_with_clock();
        let err = store
            .register(registration("card", "10.0.0.1", 8080), u64::MAX / 1000)
            .unwrap_err();
        assert!(matches!(err, TellerError::IllegalArgument(_)));
        assert!(store.is_empty());

        assert!(store
            .register(registration("card", "10.0.0.1", 8080), MAX_LEASE_DURATION_SECS)
            .is_ok());
    }

    #[test]
    fn test_reregister_same_id_refreshes_in_place() {
        let (store, clock) = store_with_clock();
        store
            .register(registration("card", "10.0.0.1", 8080).with_instance_id("card-1"), 30)
            .unwrap();
        store
            .register(registration("card", "10.0.0.2", 8080).with_instance_id("card-2"), 30)
            .unwrap();

        clock.advance(Duration::from_secs(10));
        let mut again = registration("card", "10.0.0.1", 8080).with_instance_id("card-1");
        again.metadata.insert("zone".to_string(), "b".to_string());
        let lease = store.register(again, 60).unwrap();

        assert_eq!(lease.instance_id, "card-1");
        assert_eq!(lease.expiry_timestamp, 1_010_000 + 60_000);
        assert_eq!(store.len(), 2);

        // Registration order is unchanged
        let ids: Vec<_> = store.lookup("card").into_iter().map(|i| i.instance_id).collect();
        assert_eq!(ids, vec!["card-1", "card-2"]);

        let instance = store.instance("card-1").unwrap();
        assert_eq!(instance.metadata.get("zone").map(String::as_str), Some("b"));
        assert_eq!(instance.registration_timestamp, 1_000_000);
        assert_eq!(instance.last_renewal_timestamp, 1_010_000);
    }

    #[test]
    fn test_reregister_same_id_brings_down_instance_back() {
        let (store, _) = store_with_clock();
        store
            .register(registration("card", "10.0.0.1", 8080).with_instance_id("card-1"), 30)
            .unwrap();
        store.set_status("card-1", InstanceStatus::Down).unwrap();

        store
            .register(registration("card", "10.0.0.1", 8080).with_instance_id("card-1"), 30)
            .unwrap();
        assert_eq!(store.instance("card-1").unwrap().status, InstanceStatus::Up);
        assert_eq!(store.lookup("card").len(), 1);
    }

    #[test]
    fn test_lookup_preserves_registration_order() {
        let (store, _) = store_with_clock();
        let a = store.register(registration("card", "10.0.0.3", 8080), 30).unwrap();
        let b = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        let c = store.register(registration("card", "10.0.0.2", 8080), 30).unwrap();

        let ids: Vec<String> = store
            .lookup("card")
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(ids, vec![a.instance_id, b.instance_id, c.instance_id]);
    }

    #[test]
    fn test_lookup_filters_non_up() {
        let (store, _) = store_with_clock();
        let a = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        store.register(registration("card", "10.0.0.2", 8080), 30).unwrap();
        let mut starting = registration("card", "10.0.0.3", 8080);
        starting.status = Some(InstanceStatus::Starting);
        store.register(starting, 30).unwrap();

        store
            .set_status(&a.instance_id, InstanceStatus::OutOfService)
            .unwrap();

        assert_eq!(store.lookup("card").len(), 1);
        assert_eq!(store.lookup_all("card").len(), 3);
    }

    #[test]
    fn test_renew_unknown_instance() {
        let (store, _) = store_with_clock();
        let err = store.renew("nope").unwrap_err();
        assert_eq!(err, TellerError::UnknownInstance("nope".to_string()));
    }

    #[test]
    fn test_renew_extends_lease() {
        let (store, clock) = store_with_clock();
        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();

        clock.advance(Duration::from_secs(20));
        let renewed = store.renew(&lease.instance_id).unwrap();
        assert_eq!(renewed.expiry_timestamp, lease.expiry_timestamp + 20_000);
        assert_eq!(
            store.instance(&lease.instance_id).unwrap().last_renewal_timestamp,
            clock.now_millis()
        );
    }

    #[test]
    fn test_renew_restores_down_instance() {
        let (store, _) = store_with_clock();
        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        store.set_status(&lease.instance_id, InstanceStatus::Down).unwrap();
        assert!(store.lookup("card").is_empty());

        store.renew(&lease.instance_id).unwrap();
        assert_eq!(store.lookup("card").len(), 1);
    }

    #[test]
    fn test_renew_keeps_out_of_service() {
        let (store, _) = store_with_clock();
        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        store
            .set_status(&lease.instance_id, InstanceStatus::OutOfService)
            .unwrap();

        store.renew(&lease.instance_id).unwrap();
        assert_eq!(
            store.instance(&lease.instance_id).unwrap().status,
            InstanceStatus::OutOfService
        );
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let (store, _) = store_with_clock();
        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();

        assert!(store.deregister(&lease.instance_id));
        assert!(!store.deregister(&lease.instance_id));
        assert!(!store.deregister("never-registered"));
        assert!(store.lookup("card").is_empty());
        assert!(store.services().is_empty());

        // Address is free again
        assert!(store.register(registration("card", "10.0.0.1", 8080), 30).is_ok());
    }

    #[test]
    fn test_evict_respects_renewal_after_check_started() {
        let (store, clock) = store_with_clock();
        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();

        clock.advance(Duration::from_secs(31));
        let check_started = clock.now_millis();
        let candidates = store.expired_candidates(check_started);
        assert_eq!(candidates, vec![lease.instance_id.clone()]);

        // Renewal lands between candidate collection and commit
        store.renew(&lease.instance_id).unwrap();

        assert!(store.evict_if_expired(&lease.instance_id, check_started).is_none());
        assert_eq!(store.lookup("card").len(), 1);
    }

    #[test]
    fn test_purge_frees_address_and_id() {
        let (store, clock) = store_with_clock();
        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();

        clock.advance(Duration::from_secs(31));
        let now = clock.now_millis();
        store.evict_if_expired(&lease.instance_id, now).unwrap();

        // Inside grace: not purged
        assert!(store.purge_if_stale(&lease.instance_id, now, 60_000).is_none());

        clock.advance(Duration::from_secs(61));
        let purged = store
            .purge_if_stale(&lease.instance_id, clock.now_millis(), 60_000)
            .unwrap();
        assert_eq!(purged.instance_id, lease.instance_id);
        assert!(store.is_empty());
        assert!(matches!(
            store.renew(&lease.instance_id),
            Err(TellerError::UnknownInstance(_))
        ));
    }

    #[test]
    fn test_services_summary() {
        let (store, _) = store_with_clock();
        let a = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        store.register(registration("card", "10.0.0.2", 8080), 30).unwrap();
        store.register(registration("account", "10.0.0.3", 8080), 30).unwrap();
        store.set_status(&a.instance_id, InstanceStatus::Down).unwrap();

        let summaries = store.services();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, "account");
        assert_eq!(summaries[1].name, "card");
        assert_eq!(summaries[1].instance_count, 2);
        assert_eq!(summaries[1].up_count, 1);
    }

    #[test]
    fn test_revision_advances_on_mutation() {
        let (store, _) = store_with_clock();
        let start = store.revision();
        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        store.renew(&lease.instance_id).unwrap();
        store.deregister(&lease.instance_id);
        assert_eq!(store.revision(), start + 3);
    }

    #[tokio::test]
    async fn test_events_published() {
        let (store, _) = store_with_clock();
        let mut events = store.subscribe();

        let lease = store.register(registration("card", "10.0.0.1", 8080), 30).unwrap();
        store.deregister(&lease.instance_id);

        match events.recv().await.unwrap() {
            RegistryEvent::Registered(instance) => assert_eq!(instance.service_name, "card"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Deregistered(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_are_all_visible() {
        let store = Arc::new(RegistryStore::new());
        let mut handles = Vec::new();
        for i in 0..64u16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .register(InstanceRegistration::new("search", "10.1.0.1", 9000 + i), 30)
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.lookup("search").len(), 64);
    }

    #[test]
    fn test_concurrent_same_id_at_different_addresses_commits_once() {
        for _ in 0..32 {
            let store = Arc::new(RegistryStore::new());
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let handles: Vec<_> = ["10.0.0.1", "10.0.0.2"]
                .into_iter()
                .map(|host| {
                    let store = store.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        store.register(
                            InstanceRegistration::new("card", host, 8080).with_instance_id("card-1"),
                            30,
                        )
                    })
                })
                .collect();
            let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
            assert_eq!(store.len(), 1);
            let ids: Vec<_> = store.lookup("card").into_iter().map(|i| i.instance_id).collect();
            assert_eq!(ids, vec!["card-1"]);
        }
    }
}
