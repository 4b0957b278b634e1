//! `AntiEntropyService`: periodic full-state reconciliation between randomly
//! sampled peers, as a backstop against gossip messages lost to churn.

use crate::config::AntiEntropyConfig;
use crate::message::{MessagePayload, RegistryMessage};
use crate::registry::Registry;
use crate::transport::{GossipTransport, PeerLink, Priority};
use registry_common::{PeerId, RegistryResult, TimeProvider};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct AntiEntropyStats {
    pub rounds_attempted: u64,
    pub rounds_succeeded: u64,
    pub rounds_failed: u64,
    pub rounds_timed_out: u64,
    pub services_reconciled: u64,
    pub conflicts_detected: u64,
}

/// Drives periodic reconciliation rounds. Each round samples a handful of
/// peers, requests their full table, and merges it through the registry's
/// conflict resolver.
pub struct AntiEntropyService {
    local_peer_id: PeerId,
    registry: Arc<Registry>,
    transport: GossipTransport,
    link: Arc<dyn PeerLink>,
    time: Arc<dyn TimeProvider>,
    config: AntiEntropyConfig,
    running: AtomicBool,
    rounds_attempted: AtomicU64,
    rounds_succeeded: AtomicU64,
    rounds_failed: AtomicU64,
    rounds_timed_out: AtomicU64,
    services_reconciled: AtomicU64,
    conflicts_detected: AtomicU64,
}

impl AntiEntropyService {
    pub fn new(
        local_peer_id: PeerId,
        registry: Arc<Registry>,
        transport: GossipTransport,
        link: Arc<dyn PeerLink>,
        time: Arc<dyn TimeProvider>,
        config: AntiEntropyConfig,
    ) -> Self {
        Self {
            local_peer_id,
            registry,
            transport,
            link,
            time,
            config,
            running: AtomicBool::new(false),
            rounds_attempted: AtomicU64::new(0),
            rounds_succeeded: AtomicU64::new(0),
            rounds_failed: AtomicU64::new(0),
            rounds_timed_out: AtomicU64::new(0),
            services_reconciled: AtomicU64::new(0),
            conflicts_detected: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> AntiEntropyStats {
        AntiEntropyStats {
            rounds_attempted: self.rounds_attempted.load(Ordering::SeqCst),
            rounds_succeeded: self.rounds_succeeded.load(Ordering::SeqCst),
            rounds_failed: self.rounds_failed.load(Ordering::SeqCst),
            rounds_timed_out: self.rounds_timed_out.load(Ordering::SeqCst),
            services_reconciled: self.services_reconciled.load(Ordering::SeqCst),
            conflicts_detected: self.conflicts_detected.load(Ordering::SeqCst),
        }
    }

    /// Spawn the periodic reconciliation loop. No-op (but not an error) when
    /// disabled in config, matching how the gossip interval is skipped.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            log::debug!("anti-entropy disabled by configuration");
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(service.config.interval_ms));
            loop {
                ticker.tick().await;
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
                service.run_round().await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Force an out-of-band reconciliation round, e.g. right after startup.
    pub async fn trigger_reconciliation(&self) {
        self.run_round().await;
    }

    async fn run_round(&self) {
        self.rounds_attempted.fetch_add(1, Ordering::SeqCst);
        let deadline = std::time::Duration::from_millis(self.config.max_reconciliation_time_ms);

        match tokio::time::timeout(deadline, self.reconcile_once()).await {
            Ok(Ok(())) => {
                self.rounds_succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(err)) => {
                log::warn!("anti-entropy round failed: {err}");
                self.rounds_failed.fetch_add(1, Ordering::SeqCst);
            }
            Err(_elapsed) => {
                log::warn!("anti-entropy round exceeded its deadline");
                self.rounds_timed_out.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// One reconciliation round: for each sampled peer, concurrently push a
    /// local-snapshot `AntiEntropy` and ask for theirs via `SyncRequest`.
    async fn reconcile_once(&self) -> RegistryResult<()> {
        let peers = self.sample_peers();
        if peers.is_empty() {
            return Ok(());
        }

        let snapshot = self.registry.snapshot();
        let push = RegistryMessage::new(
            self.local_peer_id.clone(),
            self.time.unix_millis(),
            MessagePayload::AntiEntropy {
                registry_snapshot: snapshot,
                sync_version: 0,
            },
        )
        .with_max_hops(1);
        let pull = RegistryMessage::new(
            self.local_peer_id.clone(),
            self.time.unix_millis(),
            MessagePayload::SyncRequest {
                requested_service_types: Vec::new(),
            },
        )
        .with_max_hops(1);

        let push_frame = push.to_bytes()?;
        let pull_frame = pull.to_bytes()?;

        let sends = peers.iter().map(|peer| {
            let push_frame = push_frame.clone();
            let pull_frame = pull_frame.clone();
            async move {
                let _ = self.link.send_to(peer, &push_frame).await;
                let _ = self.link.send_to(peer, &pull_frame).await;
            }
        });
        futures::future::join_all(sends).await;
        Ok(())
    }

    fn sample_peers(&self) -> Vec<PeerId> {
        let mut peers = self.transport.known_peers();
        fastrand::shuffle(&mut peers);
        peers.truncate(self.config.peer_selection_count);
        peers
    }

    /// Fold a full snapshot received as a `SyncResponse`/`AntiEntropy` reply
    /// into the registry and tally it into this round's statistics. Called
    /// by the owning network loop once a reply frame has been decoded.
    pub fn apply_reply(&self, message: &RegistryMessage) {
        if let MessagePayload::SyncResponse { registry_snapshot, .. }
        | MessagePayload::AntiEntropy { registry_snapshot, .. } = &message.payload
        {
            let (seen, conflicts) = self.registry.merge_snapshot(registry_snapshot);
            self.services_reconciled.fetch_add(seen as u64, Ordering::SeqCst);
            self.conflicts_detected.fetch_add(conflicts as u64, Ordering::SeqCst);
        }
    }

    /// Broadcast the full local table as an `AntiEntropy` push, used by
    /// peers that prefer push-based reconciliation over request/response.
    pub async fn push_full_state(&self) -> RegistryResult<()> {
        let snapshot = self.registry.snapshot();
        let message = RegistryMessage::new(
            self.local_peer_id.clone(),
            self.time.unix_millis(),
            MessagePayload::AntiEntropy {
                registry_snapshot: snapshot,
                sync_version: 0,
            },
        )
        .with_max_hops(1);
        self.transport.broadcast(message, Priority::Low).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GossipConfig, PeerConfig, RegistryConfig};
    use crate::transport::GossipTransport;
    use async_trait::async_trait;
    use registry_common::FixedTimeProvider;
    use std::sync::Mutex;

    struct RecordingLink {
        sent: Mutex<Vec<PeerId>>,
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn send_to(&self, peer: &PeerId, _frame: &[u8]) -> RegistryResult<()> {
            self.sent.lock().unwrap().push(peer.clone());
            Ok(())
        }
    }

    fn build(config: AntiEntropyConfig) -> (Arc<AntiEntropyService>, Arc<RecordingLink>) {
        let time: Arc<dyn TimeProvider> = Arc::new(FixedTimeProvider::new(1_000));
        let registry_config = RegistryConfig {
            peer: PeerConfig {
                peer_id: PeerId::new("p1"),
                ..PeerConfig::default()
            },
            gossip: GossipConfig::default(),
            ..RegistryConfig::default()
        };
        let link = Arc::new(RecordingLink {
            sent: Mutex::new(Vec::new()),
        });
        let (transport, _events) = GossipTransport::new(
            registry_config.peer.peer_id.clone(),
            registry_config.gossip.clone(),
            link.clone(),
            time.clone(),
        );
        transport.add_peer(PeerId::new("p2"));
        transport.add_peer(PeerId::new("p3"));
        transport.add_peer(PeerId::new("p4"));

        let local_peer_id = registry_config.peer.peer_id.clone();
        let registry = Arc::new(Registry::new(registry_config, transport.clone(), time.clone()));
        let service = Arc::new(AntiEntropyService::new(
            local_peer_id,
            registry,
            transport,
            link.clone(),
            time,
            config,
        ));
        (service, link)
    }

    #[tokio::test]
    async fn reconcile_once_requests_sync_from_sampled_peers() {
        let (service, link) = build(AntiEntropyConfig {
            peer_selection_count: 2,
            ..AntiEntropyConfig::default()
        });
        service.trigger_reconciliation().await;
        // Each sampled peer gets both an AntiEntropy push and a SyncRequest pull.
        assert_eq!(link.sent.lock().unwrap().len(), 4);
        assert_eq!(service.stats().rounds_attempted, 1);
        assert_eq!(service.stats().rounds_succeeded, 1);
    }

    #[tokio::test]
    async fn disabled_config_never_schedules_a_round() {
        let (service, _link) = build(AntiEntropyConfig {
            enabled: false,
            ..AntiEntropyConfig::default()
        });
        service.start();
        assert_eq!(service.stats().rounds_attempted, 0);
    }
}
