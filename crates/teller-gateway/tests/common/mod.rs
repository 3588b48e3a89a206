//! Scripted discovery and upstream doubles shared by the gateway tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use teller_api::ServiceInstance;
use teller_client::ServiceDiscovery;
use teller_gateway::{ForwardRequest, Upstream, UpstreamError, UpstreamResponse};

#[derive(Clone, Copy)]
pub enum Behavior {
    Respond(u16),
    Refuse,
    Hang,
}

#[derive(Default)]
pub struct StaticDiscovery {
    services: Mutex<HashMap<String, Vec<ServiceInstance>>>,
}

impl StaticDiscovery {
    pub fn set(&self, service: &str, instances: Vec<ServiceInstance>) {
        self.services.lock().insert(service.to_string(), instances);
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn instances(&self, service_name: &str) -> teller_client::Result<Vec<ServiceInstance>> {
        Ok(self
            .services
            .lock()
            .get(service_name)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub instance_id: String,
    pub upstream_path: String,
    pub request: ForwardRequest,
}

#[derive(Default)]
pub struct ScriptedUpstream {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedUpstream {
    pub fn script(&self, instance_id: &str, behavior: Behavior) {
        self.behaviors.lock().insert(instance_id.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn called_instances(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.instance_id.clone()).collect()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &ForwardRequest,
        upstream_path: &str,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.lock().push(RecordedCall {
            instance_id: instance.instance_id.clone(),
            upstream_path: upstream_path.to_string(),
            request: request.clone(),
        });
        let behavior = self
            .behaviors
            .lock()
            .get(&instance.instance_id)
            .copied()
            .unwrap_or(Behavior::Respond(200));

        match behavior {
            Behavior::Respond(status) => Ok(UpstreamResponse {
                status,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body: Bytes::from(format!("from {}", instance.instance_id)),
            }),
            Behavior::Refuse => Err(UpstreamError::Connect("connection refused".to_string())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(UpstreamResponse::new(200))
            }
        }
    }
}

pub fn instance(service: &str, id: &str, port: u16) -> ServiceInstance {
    ServiceInstance {
        service_name: service.to_string(),
        instance_id: id.to_string(),
        host_address: "10.0.0.1".to_string(),
        port,
        ..Default::default()
    }
}
