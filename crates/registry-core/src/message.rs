//! `RegistryMessage`: the gossip wire format and its propagation lifecycle.

use crate::service_instance::ServiceInstance;
use registry_common::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A full snapshot of the registry table, as exchanged during sync/anti-entropy.
pub type RegistrySnapshot = HashMap<String, HashMap<String, ServiceInstance>>;

/// Payload carried by a `RegistryMessage`, one variant per gossip event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    ServiceRegister {
        instance: ServiceInstance,
    },
    ServiceUpdate {
        instance: ServiceInstance,
    },
    ServiceDeregister {
        service_type: String,
        service_id: String,
    },
    SyncRequest {
        /// Empty means "all types".
        requested_service_types: Vec<String>,
    },
    SyncResponse {
        registry_snapshot: RegistrySnapshot,
        sync_version: u64,
    },
    Heartbeat {
        instance: ServiceInstance,
    },
    AntiEntropy {
        registry_snapshot: RegistrySnapshot,
        sync_version: u64,
    },
}

impl MessagePayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessagePayload::ServiceRegister { .. } => "ServiceRegister",
            MessagePayload::ServiceUpdate { .. } => "ServiceUpdate",
            MessagePayload::ServiceDeregister { .. } => "ServiceDeregister",
            MessagePayload::SyncRequest { .. } => "SyncRequest",
            MessagePayload::SyncResponse { .. } => "SyncResponse",
            MessagePayload::Heartbeat { .. } => "Heartbeat",
            MessagePayload::AntiEntropy { .. } => "AntiEntropy",
        }
    }
}

/// A gossip message: a tagged payload plus the envelope fields every variant
/// carries (sender, timestamp, dedup id, hop tracking).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryMessage {
    pub sender_id: PeerId,
    pub timestamp: u64,
    pub message_id: uuid::Uuid,
    pub hop_count: u32,
    pub visited_peers: HashSet<PeerId>,
    pub max_hops: u32,
    pub payload: MessagePayload,
}

impl RegistryMessage {
    pub const DEFAULT_MAX_HOPS: u32 = 5;

    pub fn new(sender_id: PeerId, timestamp: u64, payload: MessagePayload) -> Self {
        Self {
            sender_id,
            timestamp,
            message_id: uuid::Uuid::new_v4(),
            hop_count: 0,
            visited_peers: HashSet::new(),
            max_hops: Self::DEFAULT_MAX_HOPS,
            payload,
        }
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// True if this message may still be forwarded at least once more.
    pub fn can_propagate(&self) -> bool {
        self.hop_count < self.max_hops
    }

    /// A copy bumped for re-propagation: hop count +1, local peer marked visited.
    pub fn increment_hop(&self, local_peer_id: &PeerId) -> Self {
        let mut next = self.clone();
        next.hop_count += 1;
        next.visited_peers.insert(local_peer_id.clone());
        next
    }

    /// True once `now - timestamp` exceeds the configured TTL.
    pub fn is_expired(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.timestamp) > ttl_ms
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, registry_common::RegistryError> {
        bincode::serialize(self)
            .map_err(|e| registry_common::RegistryError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, registry_common::RegistryError> {
        bincode::deserialize(bytes)
            .map_err(|e| registry_common::RegistryError::MalformedFrame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> RegistryMessage {
        RegistryMessage::new(
            PeerId::new("p1"),
            1_000,
            MessagePayload::ServiceDeregister {
                service_type: "web".into(),
                service_id: "w1".into(),
            },
        )
    }

    #[test]
    fn can_propagate_respects_max_hops() {
        let msg = sample_message().with_max_hops(2);
        assert!(msg.can_propagate());
        let once = msg.increment_hop(&PeerId::new("p2"));
        assert!(once.can_propagate());
        let twice = once.increment_hop(&PeerId::new("p3"));
        assert!(!twice.can_propagate());
    }

    #[test]
    fn increment_hop_tracks_visited_peers() {
        let msg = sample_message();
        let next = msg.increment_hop(&PeerId::new("p2"));
        assert_eq!(next.hop_count, 1);
        assert!(next.visited_peers.contains(&PeerId::new("p2")));
        assert!(!msg.visited_peers.contains(&PeerId::new("p2")));
    }

    #[test]
    fn expiry_uses_ttl_window() {
        let msg = sample_message();
        assert!(!msg.is_expired(1_500, 1_000));
        assert!(msg.is_expired(2_500, 1_000));
    }

    #[test]
    fn serialize_deserialize_roundtrips() {
        let msg = sample_message();
        let bytes = msg.to_bytes().unwrap();
        let restored = RegistryMessage::from_bytes(&bytes).unwrap();
        assert_eq!(restored.message_id, msg.message_id);
        assert_eq!(restored.sender_id, msg.sender_id);
        assert_eq!(restored.hop_count, msg.hop_count);
        assert_eq!(restored.type_name(), msg.type_name());
    }

    #[test]
    fn malformed_bytes_are_reported_not_panicked() {
        let err = RegistryMessage::from_bytes(&[0xFF, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, registry_common::RegistryError::MalformedFrame(_)));
    }
}
