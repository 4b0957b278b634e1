//! `TcpPeerLink`: the production [`PeerLink`], one TCP connection per send,
//! length-prefixed bincode frames over the gossip port — per the transport's
//! connection-oriented wire protocol. Tests substitute an in-process mock
//! instead (see `transport::tests` and `tests/gossip_scenarios.rs`).

use crate::transport::PeerLink;
use async_trait::async_trait;
use dashmap::DashMap;
use registry_common::{PeerId, RegistryError, RegistryResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Big-endian `u32` byte count prefixing every frame on the wire.
const LENGTH_PREFIX_BYTES: usize = 4;
/// Refuse to read a frame claiming to be larger than this; guards the
/// listener against a malformed or hostile length prefix turning into an
/// unbounded allocation.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Real network [`PeerLink`]: peer addresses are resolved from a small
/// in-memory book. Populating that book (from bootstrap config or a
/// discovery service) is outside this crate's scope, per the core's
/// "configuration and peer discovery are external collaborators" boundary —
/// see [`TcpPeerLink::register_address`].
pub struct TcpPeerLink {
    addresses: DashMap<PeerId, SocketAddr>,
}

impl TcpPeerLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            addresses: DashMap::new(),
        })
    }

    /// Bind the gossip listening socket. Fails with `StartupError` if the
    /// address cannot be bound (port already in use, insufficient
    /// permissions, etc.) per the core's startup contract.
    pub async fn bind(local_addr: SocketAddr) -> RegistryResult<TcpListener> {
        TcpListener::bind(local_addr)
            .await
            .map_err(|e| RegistryError::StartupError(e.to_string()))
    }

    /// Record (or update) the socket address a peer's frames should be sent
    /// to. A send to a peer with no registered address fails with
    /// `PeerNotFound` rather than blocking.
    pub fn register_address(&self, peer: PeerId, addr: SocketAddr) {
        self.addresses.insert(peer, addr);
    }

    /// Accept loop over an already-bound listener: one task per connection,
    /// each decoding a stream of length-prefixed frames and handing the raw
    /// bytes to `on_frame`. A malformed length prefix or a connection error
    /// drops that connection and logs — it never brings down the listener,
    /// per the "log and drop the packet" failure rule.
    pub fn serve<F>(self: &Arc<Self>, listener: TcpListener, on_frame: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + Clone + 'static,
    {
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("gossip listener accept error: {err}");
                        continue;
                    }
                };
                let on_frame = on_frame.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, &on_frame).await {
                        log::debug!("connection from {peer_addr} closed: {err}");
                    }
                });
            }
        });
    }
}

async fn serve_connection<F>(mut stream: TcpStream, on_frame: &F) -> std::io::Result<()>
where
    F: Fn(Vec<u8>),
{
    loop {
        let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            log::warn!("dropping oversized frame claiming {len} bytes");
            return Ok(());
        }
        let mut frame = vec![0u8; len as usize];
        stream.read_exact(&mut frame).await?;
        on_frame(frame);
    }
}

#[async_trait]
impl PeerLink for TcpPeerLink {
    async fn send_to(&self, peer: &PeerId, frame: &[u8]) -> RegistryResult<()> {
        let addr = *self
            .addresses
            .get(peer)
            .ok_or_else(|| RegistryError::PeerNotFound(peer.to_string()))?;

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RegistryError::TransientSendFailure(e.to_string()))?;
        stream
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .map_err(|e| RegistryError::TransientSendFailure(e.to_string()))?;
        stream
            .write_all(frame)
            .await
            .map_err(|e| RegistryError::TransientSendFailure(e.to_string()))?;
        Ok(())
    }
}
