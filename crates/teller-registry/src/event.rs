//! Registry change events

use teller_api::{InstanceStatus, ServiceInstance};

/// Change published by the [`RegistryStore`](crate::RegistryStore).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(ServiceInstance),
    Deregistered(ServiceInstance),
    /// Lease expired; the instance is now DOWN.
    Evicted(ServiceInstance),
    /// A DOWN instance stayed expired past the eviction grace and was removed.
    Purged(ServiceInstance),
    StatusChanged {
        instance: ServiceInstance,
        previous: InstanceStatus,
    },
}

impl RegistryEvent {
    pub fn instance(&self) -> &ServiceInstance {
        match self {
            RegistryEvent::Registered(i)
            | RegistryEvent::Deregistered(i)
            | RegistryEvent::Evicted(i)
            | RegistryEvent::Purged(i) => i,
            RegistryEvent::StatusChanged { instance, .. } => instance,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.instance().service_name
    }
}
