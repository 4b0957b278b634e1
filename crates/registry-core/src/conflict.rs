//! `ConflictResolver`: deterministic policy for picking a winner among
//! instances that share identity.

use crate::config::{ConflictConfig, ConflictPolicy};
use crate::message::RegistrySnapshot;
use crate::service_instance::ServiceInstance;
use registry_common::PeerId;
use std::collections::HashMap;

/// Pure function over a non-empty set of candidates sharing `(type, id)`.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Resolve a non-empty slice of candidates to a single winner.
    ///
    /// Panics if `candidates` is empty — callers always have at least the
    /// existing local entry or the incoming one.
    pub fn resolve<'a>(&self, candidates: &'a [ServiceInstance]) -> &'a ServiceInstance {
        assert!(!candidates.is_empty(), "resolve requires at least one candidate");
        if candidates.len() == 1 {
            return &candidates[0];
        }

        match self.config.policy {
            ConflictPolicy::LastWriteWins => last_write_wins(candidates),
            ConflictPolicy::VectorClock => self.vector_clock_policy(candidates),
            ConflictPolicy::PeerPriority => self.peer_priority_policy(candidates),
            ConflictPolicy::HealthBased => health_based(candidates),
            ConflictPolicy::Composite => self.composite(candidates),
        }
    }

    fn priority_of(&self, peer: &PeerId) -> i32 {
        self.config.peer_priorities.get(peer).copied().unwrap_or(0)
    }

    fn vector_clock_policy<'a>(&self, candidates: &'a [ServiceInstance]) -> &'a ServiceInstance {
        for candidate in candidates {
            let dominates_all = candidates
                .iter()
                .all(|other| other == candidate || candidate.vector_clock.is_after(&other.vector_clock));
            if dominates_all {
                return candidate;
            }
        }
        last_write_wins(candidates)
    }

    fn peer_priority_policy<'a>(&self, candidates: &'a [ServiceInstance]) -> &'a ServiceInstance {
        let max_priority = candidates
            .iter()
            .map(|c| self.priority_of(&c.origin_peer_id))
            .max()
            .unwrap_or(0);
        let top: Vec<&ServiceInstance> = candidates
            .iter()
            .filter(|c| self.priority_of(&c.origin_peer_id) == max_priority)
            .collect();
        last_write_wins_refs(&top)
    }

    fn composite<'a>(&self, candidates: &'a [ServiceInstance]) -> &'a ServiceInstance {
        let healthy: Vec<&ServiceInstance> = candidates.iter().filter(|c| c.healthy).collect();
        let pool: Vec<&ServiceInstance> = if healthy.is_empty() {
            candidates.iter().collect()
        } else {
            healthy
        };

        let max_priority = pool
            .iter()
            .map(|c| self.priority_of(&c.origin_peer_id))
            .max()
            .unwrap_or(0);
        let top: Vec<&ServiceInstance> = pool
            .into_iter()
            .filter(|c| self.priority_of(&c.origin_peer_id) == max_priority)
            .collect();

        last_write_wins_refs(&top)
    }

    /// True iff `a` and `b` are the same `(serviceType, serviceId)` entry
    /// and differ in any replicated field — including `host`/`port`, since a
    /// remote write is free to move an instance to a new address under the
    /// same key. Identity (which includes `host`/`port`) is not the right
    /// comparison here: it would make two records that disagree on address
    /// always compare as non-conflicting instead of picking a winner.
    pub fn is_conflict(a: &ServiceInstance, b: &ServiceInstance) -> bool {
        a.key() == b.key()
            && (a.version != b.version || a.host != b.host || a.port != b.port || a.healthy != b.healthy)
    }

    /// Merge a list of full-table snapshots (e.g. from several peers during
    /// anti-entropy) into one reconciled snapshot.
    pub fn merge_registries(&self, snapshots: &[RegistrySnapshot]) -> RegistrySnapshot {
        let mut by_key: HashMap<(String, String), Vec<ServiceInstance>> = HashMap::new();

        for snapshot in snapshots {
            for (service_type, by_id) in snapshot {
                for (service_id, instance) in by_id {
                    by_key
                        .entry((service_type.clone(), service_id.clone()))
                        .or_default()
                        .push(instance.clone());
                }
            }
        }

        let mut merged: RegistrySnapshot = HashMap::new();
        for ((service_type, service_id), candidates) in by_key {
            let winner = self.resolve(&candidates).clone();
            merged
                .entry(service_type)
                .or_default()
                .insert(service_id, winner);
        }
        merged
    }
}

fn last_write_wins(candidates: &[ServiceInstance]) -> &ServiceInstance {
    last_write_wins_refs(&candidates.iter().collect::<Vec<_>>())
}

fn last_write_wins_refs<'a>(candidates: &[&'a ServiceInstance]) -> &'a ServiceInstance {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then(a.last_updated.cmp(&b.last_updated))
                .then(a.origin_peer_id.as_str().cmp(b.origin_peer_id.as_str()))
        })
        .expect("candidates is non-empty")
}

fn health_based(candidates: &[ServiceInstance]) -> &ServiceInstance {
    let healthy: Vec<&ServiceInstance> = candidates.iter().filter(|c| c.healthy).collect();
    if healthy.is_empty() {
        last_write_wins(candidates)
    } else {
        last_write_wins_refs(&healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_common::FixedTimeProvider;
    use registry_crdt::VectorClock;
    use std::collections::HashMap as Map;

    fn instance(origin: &str, version: u64, healthy: bool) -> ServiceInstance {
        let time = FixedTimeProvider::new(version);
        ServiceInstance::new(
            "cache",
            "c1",
            "10.0.0.1",
            6379,
            Map::new(),
            PeerId::new(origin),
            VectorClock::new(),
            &time,
        )
        .unwrap()
        .with_healthy(healthy, &time)
        .with_version(version, &time)
    }

    #[test]
    fn last_write_wins_picks_highest_version() {
        let resolver = ConflictResolver::new(ConflictConfig {
            policy: ConflictPolicy::LastWriteWins,
            peer_priorities: Map::new(),
        });
        let a = instance("p1", 100, true);
        let b = instance("p2", 200, true);
        let winner = resolver.resolve(&[a, b]);
        assert_eq!(winner.origin_peer_id, PeerId::new("p2"));
    }

    #[test]
    fn health_based_prefers_healthy_even_if_older() {
        let resolver = ConflictResolver::new(ConflictConfig {
            policy: ConflictPolicy::HealthBased,
            peer_priorities: Map::new(),
        });
        let healthy_old = instance("p1", 100, true);
        let unhealthy_new = instance("p2", 200, false);
        let winner = resolver.resolve(&[healthy_old, unhealthy_new]);
        assert_eq!(winner.origin_peer_id, PeerId::new("p1"));
    }

    #[test]
    fn composite_prefers_healthy_then_priority_then_lww() {
        let mut priorities = Map::new();
        priorities.insert(PeerId::new("p1"), 5);
        let resolver = ConflictResolver::new(ConflictConfig {
            policy: ConflictPolicy::Composite,
            peer_priorities: priorities,
        });

        // p1 healthy but lower version, p2 unhealthy but newer version.
        let healthy_p1 = instance("p1", 100, true);
        let unhealthy_p2 = instance("p2", 200, false);
        let winner = resolver.resolve(&[healthy_p1, unhealthy_p2]);
        assert_eq!(winner.origin_peer_id, PeerId::new("p1"));
    }

    #[test]
    fn is_conflict_detects_differing_replicated_fields() {
        let a = instance("p1", 100, true);
        let b = instance("p1", 200, true);
        assert!(ConflictResolver::is_conflict(&a, &b));

        let c = instance("p1", 100, true);
        assert!(!ConflictResolver::is_conflict(&a, &c));
    }

    #[test]
    fn merge_registries_resolves_per_key_across_snapshots() {
        let resolver = ConflictResolver::new(ConflictConfig::default());
        let a = instance("p1", 100, true);
        let b = instance("p2", 200, true);

        let mut snap1: RegistrySnapshot = Map::new();
        snap1
            .entry("cache".to_string())
            .or_default()
            .insert("c1".to_string(), a);
        let mut snap2: RegistrySnapshot = Map::new();
        snap2
            .entry("cache".to_string())
            .or_default()
            .insert("c1".to_string(), b);

        let merged = resolver.merge_registries(&[snap1, snap2]);
        let winner = &merged["cache"]["c1"];
        assert_eq!(winner.origin_peer_id, PeerId::new("p2"));
    }
}
