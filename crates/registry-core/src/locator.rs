//! `ServiceLocator`: client-facing lookup over a `Registry`, with a
//! load-balancing policy for picking among healthy instances.

use crate::config::LoadBalancing;
use crate::registry::Registry;
use crate::service_instance::ServiceInstance;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Read-only view over a `Registry` for service consumers: picks one
/// instance per call rather than handing back the whole candidate list.
pub struct ServiceLocator {
    registry: Arc<Registry>,
    load_balancing: LoadBalancing,
    round_robin_cursor: AtomicUsize,
}

impl ServiceLocator {
    pub fn new(registry: Arc<Registry>, load_balancing: LoadBalancing) -> Self {
        Self {
            registry,
            load_balancing,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// Pick one healthy instance of `service_type`, or `None` if none are
    /// currently healthy.
    pub fn locate(&self, service_type: &str) -> Option<ServiceInstance> {
        let healthy = self.healthy_candidates(service_type);
        if healthy.is_empty() {
            return None;
        }
        match self.load_balancing {
            LoadBalancing::Random => {
                let index = fastrand::usize(..healthy.len());
                Some(healthy[index].clone())
            }
            LoadBalancing::RoundRobin => {
                let index = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst) % healthy.len();
                Some(healthy[index].clone())
            }
        }
    }

    /// Look up one specific instance regardless of health.
    pub fn locate_by_id(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance> {
        self.registry.get_service(service_type, service_id)
    }

    /// All known instances of a type, healthy or not.
    pub fn all(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.registry.discover_all_services(service_type)
    }

    fn healthy_candidates(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.registry.discover_services(service_type)
    }
}
