//! `Registry`: the replicated service table and its gossip event handlers.

use crate::config::RegistryConfig;
use crate::conflict::ConflictResolver;
use crate::message::{MessagePayload, RegistryMessage, RegistrySnapshot};
use crate::service_instance::ServiceInstance;
use crate::transport::{GossipTransport, Priority};
use dashmap::DashMap;
use registry_common::{PeerId, RegistryError, RegistryResult, TimeProvider};
use registry_crdt::VectorClock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct RegistryStats {
    pub services_registered: u64,
    pub services_deregistered: u64,
    pub conflicts_resolved: u64,
    pub remote_updates_applied: u64,
    pub remote_updates_rejected: u64,
}

/// The replicated table of `(serviceType, serviceId) -> ServiceInstance`,
/// plus the logic that keeps it converging with remote peers.
///
/// Table access goes through `DashMap` so reads never block on a writer
/// working through an unrelated key.
pub struct Registry {
    local_peer_id: PeerId,
    table: DashMap<(String, String), ServiceInstance>,
    vector_clock: std::sync::RwLock<VectorClock>,
    transport: GossipTransport,
    resolver: ConflictResolver,
    time: Arc<dyn TimeProvider>,
    config: RegistryConfig,
    running: AtomicBool,
    registry_version: AtomicU64,
    services_registered: AtomicU64,
    services_deregistered: AtomicU64,
    conflicts_resolved: AtomicU64,
    remote_updates_applied: AtomicU64,
    remote_updates_rejected: AtomicU64,
}

impl Registry {
    pub fn new(
        config: RegistryConfig,
        transport: GossipTransport,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let resolver = ConflictResolver::new(config.conflict.clone());
        Self {
            local_peer_id: config.peer.peer_id.clone(),
            table: DashMap::new(),
            vector_clock: std::sync::RwLock::new(VectorClock::new()),
            transport,
            resolver,
            time,
            config,
            running: AtomicBool::new(false),
            registry_version: AtomicU64::new(0),
            services_registered: AtomicU64::new(0),
            services_deregistered: AtomicU64::new(0),
            conflicts_resolved: AtomicU64::new(0),
            remote_updates_applied: AtomicU64::new(0),
            remote_updates_rejected: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.transport.start();
        self.bootstrap();
    }

    /// Seed the peer table from `PeerConfig.bootstrap_peers` and ask each of
    /// them for their current table, so a freshly started node doesn't have
    /// to wait for the next anti-entropy round (or someone else's gossip) to
    /// learn what's already registered.
    fn bootstrap(&self) {
        let bootstrap_peers: Vec<PeerId> = self
            .config
            .peer
            .bootstrap_peers
            .iter()
            .map(|id| PeerId::new(id.clone()))
            .collect();
        if bootstrap_peers.is_empty() {
            return;
        }
        for peer in &bootstrap_peers {
            self.transport.add_peer(peer.clone());
        }

        let request = RegistryMessage::new(
            self.local_peer_id.clone(),
            self.time.unix_millis(),
            MessagePayload::SyncRequest {
                requested_service_types: Vec::new(),
            },
        )
        .with_max_hops(1);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            for peer in bootstrap_peers {
                if let Err(err) = transport.send_direct(&peer, request.clone()).await {
                    log::warn!("bootstrap sync request to {peer} failed: {err}");
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.transport.stop();
    }

    fn require_running(&self) -> RegistryResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::NotRunning)
        }
    }

    fn next_vector_clock(&self) -> VectorClock {
        let mut guard = self.vector_clock.write().expect("vector clock lock poisoned");
        let next = guard.increment(&self.local_peer_id);
        *guard = next.clone();
        next
    }

    /// Register or update the local node's own service instance and gossip
    /// it to the network.
    ///
    /// If an entry already exists for `(service_type, service_id)`, the
    /// `ConflictResolver` is consulted on the pair; the new entry is adopted
    /// (and broadcast) only if it wins. Returns whether the new entry was
    /// adopted.
    pub async fn register_service(
        &self,
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        metadata: HashMap<String, String>,
    ) -> RegistryResult<bool> {
        self.require_running()?;
        let clock = self.next_vector_clock();
        let instance = ServiceInstance::new(
            service_type,
            service_id,
            host,
            port,
            metadata,
            self.local_peer_id.clone(),
            clock,
            self.time.as_ref(),
        )?;

        if let Some(existing) = self.table.get(&instance.key()) {
            let existing = existing.value().clone();
            let candidates = [existing.clone(), instance.clone()];
            let winner = self.resolver.resolve(&candidates);
            let new_entry_wins = winner.version == instance.version
                && winner.host == instance.host
                && winner.origin_peer_id == instance.origin_peer_id;
            if !new_entry_wins {
                self.conflicts_resolved.fetch_add(1, Ordering::SeqCst);
                return Ok(false);
            }
        }

        self.apply_local(instance.clone());
        self.services_registered.fetch_add(1, Ordering::SeqCst);

        let message = RegistryMessage::new(
            self.local_peer_id.clone(),
            self.time.unix_millis(),
            MessagePayload::ServiceRegister {
                instance: instance.clone(),
            },
        )
        .with_max_hops(self.config.gossip.max_hops);
        self.transport.broadcast(message, Priority::Normal).await?;

        Ok(true)
    }

    /// Remove a locally-owned entry and gossip the removal. Returns `false`
    /// if the entry was already absent (no broadcast in that case).
    pub async fn deregister_service(
        &self,
        service_type: impl Into<String>,
        service_id: impl Into<String>,
    ) -> RegistryResult<bool> {
        self.require_running()?;
        let service_type = service_type.into();
        let service_id = service_id.into();
        let key = (service_type.clone(), service_id.clone());

        if self.table.remove(&key).is_none() {
            return Ok(false);
        }
        self.services_deregistered.fetch_add(1, Ordering::SeqCst);
        self.registry_version.fetch_add(1, Ordering::SeqCst);

        let message = RegistryMessage::new(
            self.local_peer_id.clone(),
            self.time.unix_millis(),
            MessagePayload::ServiceDeregister {
                service_type,
                service_id,
            },
        )
        .with_max_hops(self.config.gossip.max_hops);
        self.transport.broadcast(message, Priority::Normal).await?;
        Ok(true)
    }

    /// Healthy instances of `service_type`. Per the locate/discover
    /// contract, an unhealthy entry is still replicated (so anti-entropy and
    /// conflict resolution keep seeing it) but is not a valid answer to
    /// "what can I call right now".
    pub fn discover_services(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.table
            .iter()
            .filter(|e| e.key().0 == service_type && e.value().healthy)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Every known instance of `service_type`, healthy or not.
    pub fn discover_all_services(&self, service_type: &str) -> Vec<ServiceInstance> {
        self.table
            .iter()
            .filter(|e| e.key().0 == service_type)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn get_service(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance> {
        self.table
            .get(&(service_type.to_string(), service_id.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn is_service_healthy(&self, service_type: &str, service_id: &str) -> bool {
        self.get_service(service_type, service_id)
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    /// Flip the health flag on a locally-known entry and gossip a
    /// `Heartbeat` carrying the update. Returns `false` if the entry is
    /// unknown (no broadcast in that case).
    pub async fn update_service_health(
        &self,
        service_type: &str,
        service_id: &str,
        healthy: bool,
    ) -> RegistryResult<bool> {
        self.require_running()?;
        let key = (service_type.to_string(), service_id.to_string());
        let updated = {
            let Some(existing) = self.table.get(&key) else {
                return Ok(false);
            };
            existing.with_healthy(healthy, self.time.as_ref())
        };
        self.apply_local(updated.clone());

        let message = RegistryMessage::new(
            self.local_peer_id.clone(),
            self.time.unix_millis(),
            MessagePayload::Heartbeat { instance: updated },
        )
        .with_max_hops(self.config.gossip.max_hops);
        self.transport.broadcast(message, Priority::Low).await?;
        Ok(true)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut out: RegistrySnapshot = HashMap::new();
        for entry in self.table.iter() {
            out.entry(entry.key().0.clone())
                .or_default()
                .insert(entry.key().1.clone(), entry.value().clone());
        }
        out
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            services_registered: self.services_registered.load(Ordering::SeqCst),
            services_deregistered: self.services_deregistered.load(Ordering::SeqCst),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::SeqCst),
            remote_updates_applied: self.remote_updates_applied.load(Ordering::SeqCst),
            remote_updates_rejected: self.remote_updates_rejected.load(Ordering::SeqCst),
        }
    }

    fn apply_local(&self, instance: ServiceInstance) {
        let guard = self.vector_clock.write().expect("vector clock lock poisoned");
        let merged = guard.merge(&instance.vector_clock);
        drop(guard);
        *self.vector_clock.write().expect("vector clock lock poisoned") = merged;

        self.table.insert(instance.key(), instance);
        self.registry_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Apply a remote write, resolving against the current local entry (if
    /// any) via the configured conflict policy.
    fn apply_remote(&self, incoming: ServiceInstance) {
        let key = incoming.key();
        let accepted = match self.table.get(&key) {
            None => incoming,
            Some(existing) => {
                if !ConflictResolver::is_conflict(&existing, &incoming) {
                    self.remote_updates_applied.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                self.conflicts_resolved.fetch_add(1, Ordering::SeqCst);
                let candidates = [existing.value().clone(), incoming];
                self.resolver.resolve(&candidates).clone()
            }
        };

        {
            let mut guard = self.vector_clock.write().expect("vector clock lock poisoned");
            *guard = guard.merge(&accepted.vector_clock);
        }
        self.table.insert(key, accepted);
        self.remote_updates_applied.fetch_add(1, Ordering::SeqCst);
        self.registry_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Handle one inbound gossip message, already deduplicated by the
    /// transport. Returns the reply message to send back to the sender, if
    /// the payload warrants a direct response (e.g. `SyncRequest`).
    pub fn handle_message(&self, message: &RegistryMessage) -> Option<RegistryMessage> {
        match &message.payload {
            MessagePayload::ServiceRegister { instance }
            | MessagePayload::ServiceUpdate { instance } => {
                self.apply_remote(instance.clone());
                None
            }
            MessagePayload::Heartbeat { instance } => {
                // Heartbeats only ever move health state, never identity.
                if let Some(existing) = self.table.get(&instance.key()) {
                    if instance.version >= existing.version {
                        let updated = existing.with_healthy(instance.healthy, self.time.as_ref());
                        drop(existing);
                        self.table.insert(updated.key(), updated);
                    }
                }
                None
            }
            MessagePayload::ServiceDeregister {
                service_type,
                service_id,
            } => {
                let key = (service_type.clone(), service_id.clone());
                // Only honor the deregister if it isn't stale relative to
                // what's already on record — a reordered deregister for an
                // instance that was since re-registered with a newer
                // version must not wipe out the newer write.
                let stale = match self.table.get(&key) {
                    Some(existing) => message.timestamp < existing.version,
                    None => false,
                };
                if stale {
                    self.remote_updates_rejected.fetch_add(1, Ordering::SeqCst);
                } else if self.table.remove(&key).is_some() {
                    self.services_deregistered.fetch_add(1, Ordering::SeqCst);
                    self.registry_version.fetch_add(1, Ordering::SeqCst);
                }
                None
            }
            MessagePayload::SyncRequest {
                requested_service_types,
            } => {
                let snapshot = if requested_service_types.is_empty() {
                    self.snapshot()
                } else {
                    self.snapshot()
                        .into_iter()
                        .filter(|(service_type, _)| requested_service_types.contains(service_type))
                        .collect()
                };
                Some(
                    RegistryMessage::new(
                        self.local_peer_id.clone(),
                        self.time.unix_millis(),
                        MessagePayload::SyncResponse {
                            registry_snapshot: snapshot,
                            sync_version: self.registry_version.load(Ordering::SeqCst),
                        },
                    )
                    .with_max_hops(1),
                )
            }
            MessagePayload::SyncResponse {
                registry_snapshot, ..
            }
            | MessagePayload::AntiEntropy {
                registry_snapshot, ..
            } => {
                let _ = self.merge_snapshot(registry_snapshot);
                None
            }
        }
    }

    /// Merge a full remote snapshot into the local table, resolving any
    /// per-key conflicts. Used by `handle_message` and directly by
    /// anti-entropy reconciliation. Returns `(services_seen, conflicts_hit)`
    /// for the caller's statistics.
    pub fn merge_snapshot(&self, remote: &RegistrySnapshot) -> (usize, usize) {
        let conflicts_before = self.conflicts_resolved.load(Ordering::SeqCst);
        let mut seen = 0usize;
        for (_service_type, by_id) in remote {
            for instance in by_id.values() {
                self.apply_remote(instance.clone());
                seen += 1;
            }
        }
        let conflicts_after = self.conflicts_resolved.load(Ordering::SeqCst);
        (seen, (conflicts_after - conflicts_before) as usize)
    }
}
