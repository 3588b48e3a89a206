//! Route table
//!
//! Routes are operator configuration loaded at start-up. A path pattern is
//! a `/`-separated list of segments where `*` matches exactly one segment
//! and a trailing `**` matches any remaining suffix (including none).
//! The first route in declared order whose pattern matches wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use teller_common::TellerError;

use crate::balancer::LoadBalancePolicy;
use crate::circuit_breaker::CircuitBreakerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    any_suffix: bool,
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, TellerError> {
        if !pattern.starts_with('/') {
            return Err(TellerError::IllegalArgument(format!(
                "path pattern '{}' must start with '/'",
                pattern
            )));
        }

        let parts: Vec<&str> = path_segments(pattern).collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut any_suffix = false;

        for (i, part) in parts.iter().enumerate() {
            match *part {
                "**" if i == parts.len() - 1 => any_suffix = true,
                "**" => {
                    return Err(TellerError::IllegalArgument(format!(
                        "'**' is only allowed as the last segment of '{}'",
                        pattern
                    )));
                }
                "*" => segments.push(Segment::Wildcard),
                literal => segments.push(Segment::Literal(literal.to_string())),
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
            any_suffix,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        let mut parts = path_segments(path);

        for segment in &self.segments {
            let Some(part) = parts.next() else {
                return false;
            };
            if let Segment::Literal(literal) = segment
                && literal != part
            {
                return false;
            }
        }

        self.any_suffix || parts.next().is_none()
    }
}

/// Circuit breaker block of a route definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub failure_rate_threshold: Option<f64>,
    pub minimum_calls: u32,
    pub cooldown_ms: u64,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            failure_window_ms: config.failure_window.as_millis() as u64,
            failure_rate_threshold: config.failure_rate_threshold,
            minimum_calls: config.minimum_calls,
            cooldown_ms: config.cooldown.as_millis() as u64,
            half_open_max_calls: config.half_open_max_calls,
            success_threshold: config.success_threshold,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_millis(self.failure_window_ms),
            failure_rate_threshold: self.failure_rate_threshold,
            minimum_calls: self.minimum_calls,
            cooldown: Duration::from_millis(self.cooldown_ms),
            half_open_max_calls: self.half_open_max_calls,
            success_threshold: self.success_threshold,
        }
    }
}

fn default_retries() -> u32 {
    2
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Route as written in configuration (`gateway.routes`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub id: String,
    pub path: String,
    pub service: String,
    #[serde(default)]
    pub load_balance: LoadBalancePolicy,
    /// Leading path segments removed before forwarding
    #[serde(default)]
    pub strip_prefix: usize,
    /// Extra attempts on other instances after a transient failure
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

impl RouteDefinition {
    pub fn new(id: &str, path: &str, service: &str) -> Self {
        Self {
            id: id.to_string(),
            path: path.to_string(),
            service: service.to_string(),
            load_balance: LoadBalancePolicy::default(),
            strip_prefix: 0,
            retries: default_retries(),
            timeout_ms: default_timeout_ms(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

/// Compiled route
#[derive(Debug)]
pub struct Route {
    pub definition: RouteDefinition,
    pub pattern: PathPattern,
    pub breaker_config: CircuitBreakerConfig,
    /// Round-robin position
    pub cursor: AtomicUsize,
}

impl Route {
    pub fn compile(definition: RouteDefinition) -> Result<Self, TellerError> {
        if definition.id.trim().is_empty() {
            return Err(TellerError::IllegalArgument("route id must not be empty".into()));
        }
        if definition.service.trim().is_empty() {
            return Err(TellerError::IllegalArgument(format!(
                "route '{}' has no target service",
                definition.id
            )));
        }
        if definition.timeout_ms == 0 {
            return Err(TellerError::IllegalArgument(format!(
                "route '{}' timeout must be greater than 0",
                definition.id
            )));
        }

        let pattern = PathPattern::parse(&definition.path)?;
        let breaker_config = definition.circuit_breaker.to_config();
        breaker_config.validate().map_err(|e| {
            TellerError::IllegalArgument(format!("route '{}': {}", definition.id, e))
        })?;

        Ok(Self {
            definition,
            pattern,
            breaker_config,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn service(&self) -> &str {
        &self.definition.service
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.definition.timeout_ms)
    }

    /// Path forwarded upstream after stripping the configured prefix.
    pub fn rewrite_path(&self, path: &str) -> String {
        let rest: Vec<&str> = path_segments(path)
            .skip(self.definition.strip_prefix)
            .collect();
        let mut rewritten = format!("/{}", rest.join("/"));
        if path.ends_with('/') && !rest.is_empty() {
            rewritten.push('/');
        }
        rewritten
    }
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(definitions: Vec<RouteDefinition>) -> Result<Self, TellerError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(definitions.len());

        for definition in definitions {
            if !seen.insert(definition.id.clone()) {
                return Err(TellerError::IllegalArgument(format!(
                    "duplicate route id '{}'",
                    definition.id
                )));
            }
            routes.push(Arc::new(Route::compile(definition)?));
        }

        Ok(Self { routes })
    }

    /// First route in declared order matching `path`.
    pub fn find(&self, path: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.pattern.matches(path))
            .cloned()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
