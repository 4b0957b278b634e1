//! `GossipTransport`: peer fan-out, message dedup, and delivery to the local
//! registry over a pluggable [`PeerLink`].

use crate::config::GossipConfig;
use crate::message::RegistryMessage;
use crate::peer_metrics::PeerMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use registry_common::{PeerId, RegistryError, RegistryResult, TimeProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Peers that have been unreachable this long are dropped from the peer table.
const PEER_EVICTION_MS: u64 = 5 * 60 * 1_000;
/// How often the peer-maintenance sweep runs.
const PEER_MAINTENANCE_INTERVAL_MS: u64 = 30 * 1_000;
/// Below this size, compression isn't worth the CPU.
const COMPRESSION_MIN_BYTES: usize = 512;
/// Only keep a compressed frame if it buys at least this much.
const COMPRESSION_MIN_SAVINGS_RATIO: f64 = 0.10;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Point-to-point delivery abstraction. Production code implements this over
/// TCP/QUIC; tests substitute an in-process version that hands frames
/// directly to peers' transports.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn send_to(&self, peer: &PeerId, frame: &[u8]) -> RegistryResult<()>;
}

/// Priority lanes for outbound gossip; higher drains first, FIFO within a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Events the transport hands to its owner (the registry) as messages arrive.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    MessageReceived(RegistryMessage),
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
}

#[derive(Debug, Default, Clone)]
pub struct GossipStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_deduplicated: u64,
    pub messages_dropped_ttl: u64,
    pub peers_known: usize,
}

/// Three FIFO lanes so a round's outbound work can be drained high-before-
/// normal-before-low, per the priority queue described in the gossip
/// transport design.
#[derive(Default)]
struct OutboundQueues {
    high: std::collections::VecDeque<RegistryMessage>,
    normal: std::collections::VecDeque<RegistryMessage>,
    low: std::collections::VecDeque<RegistryMessage>,
}

impl OutboundQueues {
    fn push(&mut self, priority: Priority, message: RegistryMessage) {
        match priority {
            Priority::High => self.high.push_back(message),
            Priority::Normal => self.normal.push_back(message),
            Priority::Low => self.low.push_back(message),
        }
    }

    fn pop(&mut self) -> Option<RegistryMessage> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

struct Inner {
    local_peer_id: PeerId,
    config: GossipConfig,
    link: Arc<dyn PeerLink>,
    time: Arc<dyn TimeProvider>,
    peers: DashMap<PeerId, PeerMetrics>,
    seen: DashMap<uuid::Uuid, u64>,
    events: mpsc::UnboundedSender<GossipEvent>,
    running: AtomicBool,
    outbound: tokio::sync::Mutex<OutboundQueues>,
    /// Approximates the "pending queue" load factor the adaptive fan-out
    /// formula scales against; bumped for the duration of a send and read
    /// back by `fanout_size`.
    in_flight_sends: std::sync::atomic::AtomicUsize,
    messages_sent: std::sync::atomic::AtomicU64,
    messages_received: std::sync::atomic::AtomicU64,
    messages_deduplicated: std::sync::atomic::AtomicU64,
    messages_dropped_ttl: std::sync::atomic::AtomicU64,
}

/// Gossip-layer transport: fan-out selection, hop-limited propagation,
/// duplicate suppression, and peer health bookkeeping.
#[derive(Clone)]
pub struct GossipTransport {
    inner: Arc<Inner>,
}

impl GossipTransport {
    pub fn new(
        local_peer_id: PeerId,
        config: GossipConfig,
        link: Arc<dyn PeerLink>,
        time: Arc<dyn TimeProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<GossipEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local_peer_id,
            config,
            link,
            time,
            peers: DashMap::new(),
            seen: DashMap::new(),
            events,
            running: AtomicBool::new(false),
            outbound: tokio::sync::Mutex::new(OutboundQueues::default()),
            in_flight_sends: std::sync::atomic::AtomicUsize::new(0),
            messages_sent: std::sync::atomic::AtomicU64::new(0),
            messages_received: std::sync::atomic::AtomicU64::new(0),
            messages_deduplicated: std::sync::atomic::AtomicU64::new(0),
            messages_dropped_ttl: std::sync::atomic::AtomicU64::new(0),
        });
        (Self { inner }, receiver)
    }

    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        let transport = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(PEER_MAINTENANCE_INTERVAL_MS));
            loop {
                ticker.tick().await;
                if !transport.inner.running.load(Ordering::SeqCst) {
                    break;
                }
                transport.sweep_dead_peers();
                transport.sweep_seen_cache();
            }
        });
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    pub fn add_peer(&self, peer: PeerId) {
        if self.inner.peers.insert(peer.clone(), PeerMetrics::new()).is_none() {
            let _ = self.inner.events.send(GossipEvent::PeerAdded(peer));
        }
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        if self.inner.peers.remove(peer).is_some() {
            let _ = self.inner.events.send(GossipEvent::PeerRemoved(peer.clone()));
        }
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> GossipStats {
        GossipStats {
            messages_sent: self.inner.messages_sent.load(Ordering::SeqCst),
            messages_received: self.inner.messages_received.load(Ordering::SeqCst),
            messages_deduplicated: self.inner.messages_deduplicated.load(Ordering::SeqCst),
            messages_dropped_ttl: self.inner.messages_dropped_ttl.load(Ordering::SeqCst),
            peers_known: self.inner.peers.len(),
        }
    }

    /// Enqueue a message on its priority lane, then drain the outbound
    /// queues (high before normal before low, FIFO within a lane) to a
    /// fanout-sized sample of peers per message.
    ///
    /// Enqueue itself never blocks for long: the lane is unbounded in
    /// memory but draining happens inline here rather than on a separate
    /// timer, so a caller that awaits `broadcast` observes its message (and
    /// anything queued ahead of it) sent before the call returns.
    pub async fn broadcast(&self, message: RegistryMessage, priority: Priority) -> RegistryResult<()> {
        if !message.can_propagate() {
            return Ok(());
        }
        {
            let mut queues = self.inner.outbound.lock().await;
            queues.push(priority, message);
        }
        self.drain_outbound().await
    }

    /// Send one message directly to a specific peer, bypassing fan-out
    /// selection. Used for targeted requests — e.g. the bootstrap sync pull
    /// sent to each configured bootstrap peer on startup — where the caller
    /// already knows exactly who should receive it.
    pub async fn send_direct(&self, peer: &PeerId, message: RegistryMessage) -> RegistryResult<()> {
        let outgoing = message.increment_hop(&self.inner.local_peer_id);
        let frame = self.encode(&outgoing)?;
        self.deliver(peer, &frame).await;
        self.inner.messages_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn drain_outbound(&self) -> RegistryResult<()> {
        loop {
            let next = {
                let mut queues = self.inner.outbound.lock().await;
                queues.pop()
            };
            let Some(message) = next else { break };
            self.send_one(message).await?;
        }
        Ok(())
    }

    async fn send_one(&self, message: RegistryMessage) -> RegistryResult<()> {
        let targets = self.select_fanout_peers(&message);
        let outgoing = message.increment_hop(&self.inner.local_peer_id);
        let frame = self.encode(&outgoing)?;

        self.inner.in_flight_sends.fetch_add(1, Ordering::SeqCst);
        for peer in &targets {
            self.deliver(peer, &frame).await;
        }
        self.inner.in_flight_sends.fetch_sub(1, Ordering::SeqCst);
        self.inner.messages_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Number of peers to fan out to this round.
    ///
    /// With `adaptive_fanout=false`, the fixed configured fanout (clamped to
    /// the known peer count). With `adaptive_fanout=true`, the base fanout
    /// is scaled by a load factor (`min(1, in-flight sends / 100)`) and a
    /// size factor (`log10(peers)`), then clamped between the base fanout
    /// and `max(peers/2, base)`.
    fn fanout_size(&self, known_peers: usize) -> usize {
        let base = self.inner.config.fanout;
        if !self.inner.config.adaptive_fanout || known_peers == 0 {
            return base.min(known_peers);
        }

        let load_factor = (self.inner.in_flight_sends.load(Ordering::SeqCst) as f64 / 100.0).min(1.0);
        let size_factor = (known_peers as f64).log10().max(1.0);
        let scaled = (base as f64) * (1.0 + load_factor) * size_factor;

        let upper = (known_peers / 2).max(base);
        (scaled.round() as usize).clamp(base, upper).min(known_peers)
    }

    /// Candidates for this round: healthy peers not already in the
    /// message's visited set. With `adaptive_fanout`, ordered by
    /// reliability descending (ties broken by lower average response time)
    /// and the top-N taken; otherwise a uniform-random sample.
    fn select_fanout_peers(&self, message: &RegistryMessage) -> Vec<PeerId> {
        let mut candidates: Vec<(PeerId, f64, f64)> = self
            .inner
            .peers
            .iter()
            .filter(|e| e.value().is_healthy())
            .filter(|e| !message.visited_peers.contains(e.key()))
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().reliability_score(),
                    e.value().avg_response_time_ms(),
                )
            })
            .collect();

        if candidates.is_empty() {
            return Vec::new();
        }

        if self.inner.config.adaptive_fanout {
            candidates.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
            });
        } else {
            fastrand::shuffle(&mut candidates);
        }

        let count = self.fanout_size(candidates.len());
        candidates
            .into_iter()
            .take(count)
            .map(|(peer, _, _)| peer)
            .collect()
    }

    async fn deliver(&self, peer: &PeerId, frame: &[u8]) {
        let sent_at = self.inner.time.unix_millis();
        match self.inner.link.send_to(peer, frame).await {
            Ok(()) => {
                let elapsed = self.inner.time.unix_millis().saturating_sub(sent_at);
                if let Some(mut metrics) = self.inner.peers.get_mut(peer) {
                    metrics.record_success(elapsed, self.inner.time.unix_millis());
                }
            }
            Err(err) => {
                log::warn!("gossip send to {peer} failed: {err}");
                if let Some(mut metrics) = self.inner.peers.get_mut(peer) {
                    metrics.record_failure(self.inner.time.unix_millis());
                }
            }
        }
    }

    /// Entry point for bytes arriving off the wire: decode, dedup, and either
    /// deliver locally or drop per TTL/visited rules. Returns `Ok(Some(..))`
    /// when the caller (the network listener) should re-broadcast the
    /// message on; `Ok(None)` for a message that was consumed locally only.
    pub fn handle_inbound(&self, frame: &[u8]) -> RegistryResult<Option<RegistryMessage>> {
        let message = self.decode(frame)?;
        self.inner.messages_received.fetch_add(1, Ordering::SeqCst);

        let now = self.inner.time.unix_millis();
        if message.is_expired(now, self.inner.config.message_ttl_ms) {
            self.inner.messages_dropped_ttl.fetch_add(1, Ordering::SeqCst);
            return Ok(None);
        }

        if self.inner.seen.contains_key(&message.message_id) {
            self.inner.messages_deduplicated.fetch_add(1, Ordering::SeqCst);
            return Ok(None);
        }
        self.inner.seen.insert(message.message_id, now);

        let _ = self
            .inner
            .events
            .send(GossipEvent::MessageReceived(message.clone()));

        if message.visited_peers.contains(&self.inner.local_peer_id) || !message.can_propagate() {
            return Ok(None);
        }
        Ok(Some(message))
    }

    fn encode(&self, message: &RegistryMessage) -> RegistryResult<Vec<u8>> {
        let raw = message.to_bytes()?;
        if !self.inner.config.compression_enabled || raw.len() < COMPRESSION_MIN_BYTES {
            return Ok(raw);
        }
        let compressed = gzip_compress(&raw)?;
        if (compressed.len() as f64) <= (raw.len() as f64) * (1.0 - COMPRESSION_MIN_SAVINGS_RATIO) {
            Ok(compressed)
        } else {
            Ok(raw)
        }
    }

    fn decode(&self, frame: &[u8]) -> RegistryResult<RegistryMessage> {
        if frame.starts_with(&GZIP_MAGIC) {
            let raw = gzip_decompress(frame)?;
            RegistryMessage::from_bytes(&raw)
        } else {
            RegistryMessage::from_bytes(frame)
        }
    }

    fn sweep_dead_peers(&self) {
        let now = self.inner.time.unix_millis();
        let stale: Vec<PeerId> = self
            .inner
            .peers
            .iter()
            .filter(|e| now.saturating_sub(e.value().last_operation_time) > PEER_EVICTION_MS)
            .filter(|e| e.value().last_operation_time > 0)
            .map(|e| e.key().clone())
            .collect();
        for peer in stale {
            log::debug!("evicting unreachable peer {peer}");
            self.remove_peer(&peer);
        }
    }

    fn sweep_seen_cache(&self) {
        let now = self.inner.time.unix_millis();
        let ttl = self.inner.config.message_ttl_ms;
        self.inner
            .seen
            .retain(|_, seen_at| now.saturating_sub(*seen_at) <= ttl);
    }
}

fn gzip_compress(bytes: &[u8]) -> RegistryResult<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(bytes)
        .map_err(|e| RegistryError::Serialization(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| RegistryError::Serialization(e.to_string()))
}

fn gzip_decompress(bytes: &[u8]) -> RegistryResult<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| RegistryError::MalformedFrame(e.to_string()))?;
    Ok(out)
}
