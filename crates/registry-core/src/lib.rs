//! Decentralized, gossip-based service registry.
//!
//! A `Registry` holds the local replica of the service table and applies
//! remote writes through a `ConflictResolver`; a `GossipTransport` carries
//! writes between peers and an `AntiEntropyService` repairs divergence that
//! gossip alone missed. `ServiceLocator` is the read-mostly facade clients
//! use to pick an instance.

pub mod anti_entropy;
pub mod config;
pub mod conflict;
pub mod locator;
pub mod message;
pub mod net;
pub mod peer_metrics;
pub mod registry;
pub mod service_instance;
pub mod transport;

pub use anti_entropy::{AntiEntropyService, AntiEntropyStats};
pub use config::{
    AntiEntropyConfig, ConflictConfig, ConflictPolicy, GossipConfig, LoadBalancing, LocatorConfig,
    PeerConfig, RegistryConfig,
};
pub use conflict::ConflictResolver;
pub use locator::ServiceLocator;
pub use message::{MessagePayload, RegistryMessage, RegistrySnapshot};
pub use net::TcpPeerLink;
pub use peer_metrics::PeerMetrics;
pub use registry::{Registry, RegistryStats};
pub use registry_common::{
    FixedTimeProvider, FixedTimeProviderHandle, PeerId, RegistryError, RegistryResult,
    SystemTimeProvider, TimeProvider,
};
pub use registry_crdt::VectorClock;
pub use service_instance::ServiceInstance;
pub use transport::{GossipEvent, GossipStats, GossipTransport, PeerLink, Priority};

use std::sync::Arc;

/// Wires a `Registry`, its `GossipTransport`, and its `AntiEntropyService`
/// into one unit, and starts them together.
///
/// This is a convenience constructor, not a new abstraction: each field
/// remains independently usable (e.g. a caller can hold only a
/// `ServiceLocator` built from `handle.registry()`).
pub struct RegistryHandle {
    registry: Arc<Registry>,
    transport: GossipTransport,
    anti_entropy: Arc<AntiEntropyService>,
}

impl RegistryHandle {
    pub fn new(
        config: RegistryConfig,
        link: Arc<dyn PeerLink>,
        time: Arc<dyn TimeProvider>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<GossipEvent>) {
        let (transport, events) = GossipTransport::new(
            config.peer.peer_id.clone(),
            config.gossip.clone(),
            link.clone(),
            time.clone(),
        );
        let registry = Arc::new(Registry::new(config.clone(), transport.clone(), time.clone()));
        let anti_entropy = Arc::new(AntiEntropyService::new(
            config.peer.peer_id.clone(),
            Arc::clone(&registry),
            transport.clone(),
            link,
            time,
            config.anti_entropy,
        ));

        (
            Self {
                registry,
                transport,
                anti_entropy,
            },
            events,
        )
    }

    pub fn start(&self) {
        self.registry.start();
        self.anti_entropy.start();
    }

    pub fn stop(&self) {
        self.anti_entropy.stop();
        self.registry.stop();
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn transport(&self) -> GossipTransport {
        self.transport.clone()
    }

    pub fn anti_entropy(&self) -> Arc<AntiEntropyService> {
        Arc::clone(&self.anti_entropy)
    }

    pub fn locator(&self, load_balancing: LoadBalancing) -> ServiceLocator {
        ServiceLocator::new(Arc::clone(&self.registry), load_balancing)
    }

    /// Feed one inbound wire frame through the transport and, if it still
    /// warrants local handling, into the registry. Returns a reply frame to
    /// send back to the sender, if any, and the (possibly hop-incremented)
    /// message to re-broadcast, if the transport says this message should
    /// keep propagating.
    pub fn handle_inbound_frame(
        &self,
        frame: &[u8],
    ) -> RegistryResult<(Option<Vec<u8>>, Option<RegistryMessage>)> {
        let Some(message) = self.transport.handle_inbound(frame)? else {
            return Ok((None, None));
        };
        let reply = self.registry.handle_message(&message);
        self.anti_entropy.apply_reply(&message);

        let reply_frame = match reply {
            Some(reply) => Some(reply.to_bytes()?),
            None => None,
        };
        Ok((reply_frame, Some(message)))
    }

    /// Wire an already-bound TCP listener to this handle: each inbound frame
    /// is fed through [`Self::handle_inbound_frame`], and anything that
    /// still warrants propagation is re-broadcast. Spawns its own accept
    /// loop via [`TcpPeerLink::serve`]; call once per listener.
    pub fn serve_tcp(self: &Arc<Self>, listener: tokio::net::TcpListener, link: Arc<net::TcpPeerLink>) {
        let handle = Arc::clone(self);
        link.serve(listener, move |frame| {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                match handle.handle_inbound_frame(&frame) {
                    Ok((_reply, Some(message))) => {
                        if let Err(err) = handle.transport().broadcast(message, Priority::Normal).await {
                            log::warn!("re-broadcast after inbound frame failed: {err}");
                        }
                    }
                    Ok((_reply, None)) => {}
                    Err(err) => log::warn!("failed to decode inbound frame: {err}"),
                }
            });
        });
    }
}
