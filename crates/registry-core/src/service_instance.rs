//! `ServiceInstance`: an immutable record of one registered service endpoint.

use registry_common::{PeerId, RegistryError, RegistryResult, TimeProvider};
use registry_crdt::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One registered service endpoint plus the bookkeeping needed to replicate
/// and reconcile it across peers.
///
/// Identity for equality/hashing purposes is `(service_type, service_id,
/// host, port)` — two records with the same identity but different
/// `version`/`vector_clock` are conflicting writes, not different services;
/// `ConflictResolver` decides which one survives.
///
/// The struct is immutable: every update is a `with_*` method that returns a
/// new value. The registry's table holds the single canonical slot per key
/// and replaces it wholesale on an accepted update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_type: String,
    pub service_id: String,
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
    pub healthy: bool,
    pub last_updated: u64,
    pub version: u64,
    pub origin_peer_id: PeerId,
    pub vector_clock: VectorClock,
    pub created_at: u64,
    pub priority: i32,
}

impl ServiceInstance {
    /// Build and validate a new instance as of `now`, owned by `origin`.
    ///
    /// `version` defaults to `now` (wall-clock at creation) per spec §3;
    /// callers that need a different monotonic source can follow up with
    /// [`ServiceInstance::with_version`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        metadata: HashMap<String, String>,
        origin: PeerId,
        vector_clock: VectorClock,
        time: &dyn TimeProvider,
    ) -> RegistryResult<Self> {
        let service_type = service_type.into();
        let service_id = service_id.into();
        let host = host.into();

        Self::validate(&service_type, &service_id, &host, port)?;

        let now = time.unix_millis();
        Ok(Self {
            service_type,
            service_id,
            host,
            port,
            metadata,
            healthy: true,
            last_updated: now,
            version: now,
            origin_peer_id: origin,
            vector_clock,
            created_at: now,
            priority: 0,
        })
    }

    /// Validate the fields an accepted record must satisfy (§3 invariants).
    pub fn validate(
        service_type: &str,
        service_id: &str,
        host: &str,
        _port: u16,
    ) -> RegistryResult<()> {
        if service_type.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "serviceType must not be empty".into(),
            ));
        }
        if service_id.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "serviceId must not be empty".into(),
            ));
        }
        if host.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "host must not be empty".into(),
            ));
        }
        // port is a u16 so 0..=65535 is enforced by the type itself.
        Ok(())
    }

    /// Identity tuple used for equality, hashing, and table keys.
    pub fn identity(&self) -> (String, String, String, u16) {
        (
            self.service_type.clone(),
            self.service_id.clone(),
            self.host.clone(),
            self.port,
        )
    }

    /// Key used by the registry's nested map: `(serviceType, serviceId)`.
    pub fn key(&self) -> (String, String) {
        (self.service_type.clone(), self.service_id.clone())
    }

    pub fn with_healthy(&self, healthy: bool, time: &dyn TimeProvider) -> Self {
        let mut next = self.clone();
        next.healthy = healthy;
        next.last_updated = time.unix_millis();
        next
    }

    pub fn with_version(&self, version: u64, time: &dyn TimeProvider) -> Self {
        let mut next = self.clone();
        next.version = version;
        next.last_updated = time.unix_millis();
        next
    }

    pub fn with_vector_clock(&self, vector_clock: VectorClock) -> Self {
        let mut next = self.clone();
        next.vector_clock = vector_clock;
        next
    }

    pub fn with_priority(&self, priority: i32) -> Self {
        let mut next = self.clone();
        next.priority = priority;
        next
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ServiceInstance {}

impl std::hash::Hash for ServiceInstance {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_common::FixedTimeProvider;

    fn time() -> FixedTimeProvider {
        FixedTimeProvider::new(1_000)
    }

    #[test]
    fn rejects_empty_fields() {
        let time = time();
        let err = ServiceInstance::new(
            "",
            "w1",
            "10.0.0.1",
            8080,
            HashMap::new(),
            PeerId::new("p1"),
            VectorClock::new(),
            &time,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }

    #[test]
    fn identity_ignores_version_and_metadata() {
        let time = time();
        let a = ServiceInstance::new(
            "web",
            "w1",
            "10.0.0.1",
            8080,
            HashMap::new(),
            PeerId::new("p1"),
            VectorClock::new(),
            &time,
        )
        .unwrap();
        let b = a.with_version(9_999, &time);
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a, b);
    }

    #[test]
    fn last_updated_never_precedes_created_at() {
        let time = time();
        let a = ServiceInstance::new(
            "web",
            "w1",
            "10.0.0.1",
            8080,
            HashMap::new(),
            PeerId::new("p1"),
            VectorClock::new(),
            &time,
        )
        .unwrap();
        assert!(a.last_updated >= a.created_at);

        let later = FixedTimeProvider::new(2_000);
        let updated = a.with_healthy(false, &later);
        assert!(updated.last_updated >= updated.created_at);
    }
}
