//! Load balancing policies

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use teller_api::ServiceInstance;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    #[default]
    RoundRobin,
    Random,
}

impl LoadBalancePolicy {
    /// Pick one instance. `cursor` is the route's round-robin position.
    pub fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
        cursor: &AtomicUsize,
    ) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        match self {
            LoadBalancePolicy::RoundRobin => select_round_robin(instances, cursor),
            LoadBalancePolicy::Random => select_random(instances),
        }
    }
}

fn select_round_robin<'a>(
    instances: &'a [ServiceInstance],
    cursor: &AtomicUsize,
) -> Option<&'a ServiceInstance> {
    let position = cursor.fetch_add(1, Ordering::Relaxed);
    instances.get(position % instances.len())
}

fn select_random(instances: &[ServiceInstance]) -> Option<&ServiceInstance> {
    let index = rand::rng().random_range(0..instances.len());
    instances.get(index)
}
