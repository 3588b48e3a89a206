//! Gateway router
//!
//! Resolves the route of an inbound request, picks an instance of the
//! target service through the discovery view and forwards the call under
//! the route's circuit breaker. Transient failures are retried on
//! instances not yet tried for the same request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use teller_api::ServiceInstance;
use teller_client::ServiceDiscovery;
use teller_common::TellerError;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use crate::route::{Route, RouteTable};
use crate::upstream::{ForwardRequest, Upstream, UpstreamError, UpstreamResponse};

/// Upstream statuses that mean "try another instance".
const TRANSIENT_STATUSES: &[u16] = &[502, 503, 504];

/// Result of a single forwarding attempt
#[derive(Debug)]
enum Attempt {
    /// Response to hand back to the caller as-is
    Completed(UpstreamResponse),
    /// Failure another instance may not share
    Transient(String),
    /// Failure that retrying will not fix
    Fatal(String),
}

/// Operator view of one route.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub id: String,
    pub path: String,
    pub service: String,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
}

pub struct GatewayRouter {
    routes: Arc<RouteTable>,
    discovery: Arc<dyn ServiceDiscovery>,
    upstream: Arc<dyn Upstream>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl GatewayRouter {
    pub fn new(
        routes: Arc<RouteTable>,
        discovery: Arc<dyn ServiceDiscovery>,
        upstream: Arc<dyn Upstream>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            routes,
            discovery,
            upstream,
            breakers,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Route and forward one request.
    pub async fn route(&self, request: ForwardRequest) -> Result<UpstreamResponse, TellerError> {
        let route = self
            .routes
            .find(&request.path)
            .ok_or_else(|| TellerError::RouteNotFound(request.path.clone()))?;
        self.forward(route, Arc::new(request)).await
    }

    /// Forward a request along an already matched route.
    pub async fn forward(
        &self,
        route: Arc<Route>,
        request: Arc<ForwardRequest>,
    ) -> Result<UpstreamResponse, TellerError> {
        let service = route.service().to_string();
        let instances: Vec<ServiceInstance> = match self.discovery.instances(&service).await {
            Ok(instances) => instances.into_iter().filter(|i| i.is_up()).collect(),
            Err(e) => {
                warn!(service = %service, error = %e, "Discovery lookup failed");
                Vec::new()
            }
        };
        if instances.is_empty() {
            return Err(TellerError::NoHealthyInstance(service));
        }

        let breaker = self.breakers.get_or_create(route.id(), &route.breaker_config);
        let upstream_path = Arc::new(route.rewrite_path(&request.path));
        let max_attempts = route.definition.retries.saturating_add(1);

        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = 0u32;
        let mut last_failure = String::from("no instance left to try");

        while attempts < max_attempts {
            let candidates: Vec<ServiceInstance> = instances
                .iter()
                .filter(|i| !tried.contains(&i.instance_id))
                .cloned()
                .collect();
            let Some(instance) = route
                .definition
                .load_balance
                .select(&candidates, &route.cursor)
                .cloned()
            else {
                break;
            };

            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(e) if attempts == 0 => {
                    debug!(route = %route.id(), "Circuit open, failing fast");
                    return Err(e);
                }
                Err(_) => {
                    last_failure = "circuit opened during retries".to_string();
                    break;
                }
            };

            tried.insert(instance.instance_id.clone());
            attempts += 1;

            let outcome = self
                .attempt(
                    breaker.clone(),
                    permit,
                    instance.clone(),
                    request.clone(),
                    upstream_path.clone(),
                    route.timeout(),
                )
                .await;

            match outcome {
                Attempt::Completed(response) => return Ok(response),
                Attempt::Transient(reason) => {
                    info!(
                        route = %route.id(),
                        instance_id = %instance.instance_id,
                        attempt = attempts,
                        reason = %reason,
                        "Transient upstream failure"
                    );
                    last_failure = reason;
                }
                Attempt::Fatal(reason) => {
                    return Err(TellerError::UpstreamUnavailable {
                        service,
                        attempts,
                        reason,
                    });
                }
            }
        }

        warn!(
            route = %route.id(),
            service = %service,
            attempts = attempts,
            "Upstream unavailable"
        );
        Err(TellerError::UpstreamUnavailable {
            service,
            attempts,
            reason: last_failure,
        })
    }

    /// Run one attempt in its own task so the breaker always learns the
    /// outcome, even when the caller stops waiting.
    async fn attempt(
        &self,
        breaker: Arc<CircuitBreaker>,
        permit: CallPermit,
        instance: ServiceInstance,
        request: Arc<ForwardRequest>,
        upstream_path: Arc<String>,
        timeout: Duration,
    ) -> Attempt {
        let upstream = self.upstream.clone();
        let task_breaker = breaker.clone();

        let handle = tokio::spawn(async move {
            let result =
                tokio::time::timeout(timeout, upstream.forward(&instance, &request, &upstream_path))
                    .await
                    .unwrap_or(Err(UpstreamError::Timeout(timeout)));
            let (attempt, failed) = classify(result);
            let transition = if failed {
                task_breaker.record_failure(permit)
            } else {
                task_breaker.record_success(permit)
            };
            if let Some((from, to)) = transition {
                info!(route = %task_breaker.route_id(), from = %from, to = %to, "Circuit state changed");
            }
            attempt
        });

        match handle.await {
            Ok(attempt) => attempt,
            Err(e) => {
                breaker.release(permit);
                Attempt::Fatal(format!("forwarding task failed: {}", e))
            }
        }
    }

    /// Route list with the state of each route's circuit.
    pub fn route_statuses(&self) -> Vec<RouteStatus> {
        self.routes
            .routes()
            .iter()
            .map(|route| {
                let (circuit_state, failure_count) = match self.breakers.get(route.id()) {
                    Some(breaker) => {
                        let snapshot = breaker.snapshot();
                        (snapshot.state, snapshot.failure_count)
                    }
                    None => (CircuitState::Closed, 0),
                };
                RouteStatus {
                    id: route.id().to_string(),
                    path: route.pattern.as_str().to_string(),
                    service: route.service().to_string(),
                    circuit_state,
                    failure_count,
                }
            })
            .collect()
    }
}

/// Map an upstream result to an attempt outcome and whether it counts as
/// a failure for the breaker.
fn classify(result: Result<UpstreamResponse, UpstreamError>) -> (Attempt, bool) {
    match result {
        Ok(response) if TRANSIENT_STATUSES.contains(&response.status) => (
            Attempt::Transient(format!("upstream responded {}", response.status)),
            true,
        ),
        Ok(response) if response.status >= 500 => (Attempt::Completed(response), true),
        Ok(response) => (Attempt::Completed(response), false),
        Err(e) if e.is_transient() => (Attempt::Transient(e.to_string()), true),
        Err(e) => (Attempt::Fatal(e.to_string()), true),
    }
}
