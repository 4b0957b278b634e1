//! Configuration bound from an external collaborator at `Start`.
//!
//! The core never loads or watches a config file itself — it only consumes
//! an already-parsed [`RegistryConfig`] value, matching `icn-crdt`'s and
//! `icn-network`'s own `*Config` structs.

use registry_common::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_id: PeerId,
    pub gossip_port: u16,
    pub bootstrap_peers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::new("unnamed-peer"),
            gossip_port: 6003,
            bootstrap_peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    pub interval_ms: u64,
    pub fanout: usize,
    pub message_ttl_ms: u64,
    pub max_hops: u32,
    pub adaptive_fanout: bool,
    pub compression_enabled: bool,
    pub batch_size: usize,
    pub priority_propagation: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            fanout: 3,
            message_ttl_ms: 30_000,
            max_hops: 5,
            adaptive_fanout: false,
            compression_enabled: false,
            batch_size: 10,
            priority_propagation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiEntropyConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub peer_selection_count: usize,
    pub max_reconciliation_time_ms: u64,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            peer_selection_count: 3,
            max_reconciliation_time_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    LastWriteWins,
    VectorClock,
    PeerPriority,
    HealthBased,
    Composite,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::LastWriteWins
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictConfig {
    pub policy: ConflictPolicy,
    pub peer_priorities: HashMap<PeerId, i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancing {
    Random,
    RoundRobin,
}

impl Default for LoadBalancing {
    fn default() -> Self {
        LoadBalancing::Random
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocatorConfig {
    pub load_balancing: LoadBalancing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub peer: PeerConfig,
    pub gossip: GossipConfig,
    pub anti_entropy: AntiEntropyConfig,
    pub conflict: ConflictConfig,
    pub locator: LocatorConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            gossip: GossipConfig::default(),
            anti_entropy: AntiEntropyConfig::default(),
            conflict: ConflictConfig::default(),
            locator: LocatorConfig::default(),
        }
    }
}
