//! End-to-end scenarios run over an in-process mesh of `RegistryHandle`s
//! connected by a router that re-delivers frames synchronously, mirroring
//! how the scenarios in the design doc are phrased ("within N gossip
//! intervals, Discover returns...").

use async_trait::async_trait;
use dashmap::DashMap;
use registry_core::config::{ConflictConfig, ConflictPolicy, GossipConfig, PeerConfig, RegistryConfig};
use registry_core::transport::{PeerLink, Priority};
use registry_core::{PeerId, RegistryHandle, RegistryResult, TimeProvider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Delivers frames between in-process peers by looking each target up in a
/// shared table and feeding the frame straight into its handle.
struct Router {
    peers: DashMap<PeerId, Arc<RegistryHandle>>,
}

struct RouterLink {
    router: Arc<Router>,
}

#[async_trait]
impl PeerLink for RouterLink {
    async fn send_to(&self, peer: &PeerId, frame: &[u8]) -> RegistryResult<()> {
        let Some(target) = self.router.peers.get(peer).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };
        let (_reply, to_propagate) = target.handle_inbound_frame(frame)?;
        if let Some(message) = to_propagate {
            target.transport().broadcast(message, Priority::Normal).await?;
        }
        Ok(())
    }
}

fn peer_config(id: &str, bootstrap: &[&str]) -> RegistryConfig {
    RegistryConfig {
        peer: PeerConfig {
            peer_id: PeerId::new(id),
            bootstrap_peers: bootstrap.iter().map(|s| s.to_string()).collect(),
            ..PeerConfig::default()
        },
        gossip: GossipConfig {
            fanout: 3,
            ..GossipConfig::default()
        },
        ..RegistryConfig::default()
    }
}

fn build_mesh(
    peer_ids: &[&str],
) -> (
    Arc<Router>,
    HashMap<String, Arc<RegistryHandle>>,
    Arc<registry_core::FixedTimeProvider>,
) {
    let router = Arc::new(Router {
        peers: DashMap::new(),
    });
    let clock = Arc::new(registry_core::FixedTimeProvider::new(1_000));
    let time: Arc<dyn TimeProvider> =
        Arc::new(registry_core::FixedTimeProviderHandle(clock.clone()));

    let mut handles = HashMap::new();
    for (i, id) in peer_ids.iter().enumerate() {
        let bootstrap: Vec<&str> = peer_ids[..i].to_vec();
        let config = peer_config(id, &bootstrap);
        let link = Arc::new(RouterLink {
            router: router.clone(),
        });
        let (handle, _events) = RegistryHandle::new(config, link, time.clone());
        handle.start();
        for other in peer_ids.iter().filter(|o| *o != id) {
            handle.transport().add_peer(PeerId::new(*other));
        }
        let handle = Arc::new(handle);
        router.peers.insert(PeerId::new(*id), Arc::clone(&handle));
        handles.insert(id.to_string(), handle);
    }
    (router, handles, clock)
}

async fn settle() {
    // Give spawned propagation tasks a chance to run; with max_hops=5 and a
    // 3-peer mesh this converges in well under a millisecond of wall time.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn s1_three_peer_propagation() {
    let (_router, peers, _clock) = build_mesh(&["p1", "p2", "p3"]);

    peers["p1"]
        .registry()
        .register_service(
            "web",
            "w1",
            "10.0.0.1",
            8080,
            HashMap::from([("v".to_string(), "1.0".to_string())]),
        )
        .await
        .unwrap();

    settle().await;

    for peer in ["p2", "p3"] {
        let found = peers[peer].registry().discover_services("web");
        assert_eq!(found.len(), 1, "peer {peer} should see exactly one web instance");
        assert_eq!(found[0].service_id, "w1");
        assert_eq!(found[0].host, "10.0.0.1");
        assert_eq!(found[0].port, 8080);
        assert_eq!(found[0].origin_peer_id, PeerId::new("p1"));
    }
}

#[tokio::test]
async fn s2_last_write_wins_conflict_resolution() {
    let (_router, peers, clock) = build_mesh(&["p1", "p2", "p3"]);

    peers["p1"]
        .registry()
        .register_service("cache", "c1", "10.0.0.1", 6379, HashMap::from([("role".to_string(), "master".to_string())]))
        .await
        .unwrap();
    settle().await;

    clock.advance(100);
    peers["p2"]
        .registry()
        .register_service("cache", "c1", "10.0.0.2", 6379, HashMap::from([("role".to_string(), "slave".to_string())]))
        .await
        .unwrap();
    settle().await;

    for peer in ["p1", "p2", "p3"] {
        let instance = peers[peer].registry().get_service("cache", "c1").unwrap();
        assert_eq!(instance.host, "10.0.0.2", "peer {peer} should converge on the later write");
        assert_eq!(instance.metadata.get("role").map(String::as_str), Some("slave"));
    }
}

#[tokio::test]
async fn s4_deregister_propagates() {
    let (_router, peers, _clock) = build_mesh(&["p1", "p2", "p3"]);

    peers["p1"]
        .registry()
        .register_service("web", "w1", "10.0.0.1", 8080, HashMap::new())
        .await
        .unwrap();
    settle().await;
    assert_eq!(peers["p3"].registry().discover_services("web").len(), 1);

    peers["p1"].registry().deregister_service("web", "w1").await.unwrap();
    settle().await;

    for peer in ["p2", "p3"] {
        assert!(peers[peer].registry().discover_services("web").is_empty());
    }
}

#[tokio::test]
async fn s6_duplicate_delivery_is_deduplicated() {
    let (_router, peers, _clock) = build_mesh(&["p1", "p2"]);

    peers["p1"]
        .registry()
        .register_service("web", "w1", "10.0.0.1", 8080, HashMap::new())
        .await
        .unwrap();
    settle().await;

    let frame = registry_core::RegistryMessage::new(
        PeerId::new("p1"),
        1_000,
        registry_core::MessagePayload::ServiceDeregister {
            service_type: "web".into(),
            service_id: "w1".into(),
        },
    )
    .to_bytes()
    .unwrap();

    peers["p2"].handle_inbound_frame(&frame).unwrap();
    peers["p2"].handle_inbound_frame(&frame).unwrap();

    assert_eq!(peers["p2"].transport().stats().messages_deduplicated, 1);
}

#[tokio::test]
async fn composite_policy_prefers_healthy_over_newer() {
    let mut peer_priorities = HashMap::new();
    peer_priorities.insert(PeerId::new("p1"), 0);
    peer_priorities.insert(PeerId::new("p2"), 0);

    let config = RegistryConfig {
        conflict: ConflictConfig {
            policy: ConflictPolicy::Composite,
            peer_priorities,
        },
        ..RegistryConfig::default()
    };

    let resolver = registry_core::ConflictResolver::new(config.conflict);
    let time = registry_core::FixedTimeProvider::new(1_000);

    let healthy_older = registry_core::ServiceInstance::new(
        "db",
        "d1",
        "10.0.0.1",
        5432,
        HashMap::new(),
        PeerId::new("p1"),
        registry_core::VectorClock::new(),
        &time,
    )
    .unwrap()
    .with_version(100, &time);

    let unhealthy_newer = registry_core::ServiceInstance::new(
        "db",
        "d1",
        "10.0.0.2",
        5432,
        HashMap::new(),
        PeerId::new("p2"),
        registry_core::VectorClock::new(),
        &time,
    )
    .unwrap()
    .with_version(200, &time)
    .with_healthy(false, &time);

    let winner = resolver.resolve(&[healthy_older, unhealthy_newer]);
    assert_eq!(winner.origin_peer_id, PeerId::new("p1"));
}
