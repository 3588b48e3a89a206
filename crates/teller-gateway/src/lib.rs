//! Teller Gateway - edge router for the platform services
//!
//! This crate provides:
//! - `RouteTable`: operator-configured routes matched by path pattern
//! - `GatewayRouter`: instance selection, circuit breaking and retries
//! - `CircuitBreaker`: per-route CLOSED / OPEN / HALF_OPEN state machine
//! - authentication hand-off, per-caller rate limiting and the actix surface

pub mod auth;
pub mod balancer;
pub mod circuit_breaker;
pub mod http;
pub mod rate_limit;
pub mod route;
pub mod router;
pub mod upstream;

pub use auth::{
    AllowAllAuthorizer, Authorizer, Identity, IntrospectionAuthorizer, PublicPaths,
    StaticTokenAuthorizer,
};
pub use balancer::LoadBalancePolicy;
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot,
    CircuitState,
};
pub use http::{GatewayError, GatewayState, configure};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use route::{CircuitBreakerSettings, PathPattern, Route, RouteDefinition, RouteTable};
pub use router::{GatewayRouter, RouteStatus};
pub use upstream::{ForwardRequest, HttpUpstream, Upstream, UpstreamError, UpstreamResponse};
