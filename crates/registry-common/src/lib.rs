//! Shared primitives used across the service registry crates.
//!
//! Nothing here talks to the network or holds registry state; it exists so
//! `registry-crdt` and `registry-core` can agree on peer identity, time, and
//! error shapes without depending on each other.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a peer in the gossip network.
///
/// Stable across restarts and unique across all nodes; carried verbatim in
/// every gossiped message and vector clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Wall-clock time source, injected so tests can hold time fixed.
///
/// All "now" reads in the registry go through this trait rather than calling
/// `SystemTime::now()` directly.
pub trait TimeProvider: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn unix_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Fixed time for deterministic tests; advance it manually between steps.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeProvider(pub std::sync::atomic::AtomicU64);

impl FixedTimeProvider {
    pub fn new(millis: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(millis))
    }

    pub fn advance(&self, delta_millis: u64) {
        self.0
            .fetch_add(delta_millis, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Shareable handle around a `FixedTimeProvider`, since the plain struct is
/// not `Clone` (it owns an atomic).
#[derive(Debug, Clone)]
pub struct FixedTimeProviderHandle(pub std::sync::Arc<FixedTimeProvider>);

impl TimeProvider for FixedTimeProvider {
    fn unix_millis(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl TimeProvider for FixedTimeProviderHandle {
    fn unix_millis(&self) -> u64 {
        self.0.unix_millis()
    }
}

/// Errors surfaced to callers per the registry's error-handling design.
///
/// Only `StartupError` is fatal to the call that triggers it; everything
/// else is recovered locally and folded into a boolean/empty return by the
/// caller (see `registry-core`).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("registry is not running")]
    NotRunning,

    #[error("startup failed: {0}")]
    StartupError(String),

    #[error("send to peer failed: {0}")]
    TransientSendFailure(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_display_roundtrips_string() {
        let p = PeerId::new("p1");
        assert_eq!(p.to_string(), "p1");
        assert_eq!(p.as_str(), "p1");
    }

    #[test]
    fn fixed_time_provider_advances() {
        let tp = FixedTimeProvider::new(100);
        assert_eq!(tp.unix_millis(), 100);
        tp.advance(50);
        assert_eq!(tp.unix_millis(), 150);
    }

    #[test]
    fn system_time_provider_is_monotonic_enough() {
        let tp = SystemTimeProvider;
        let a = tp.unix_millis();
        let b = tp.unix_millis();
        assert!(b >= a);
    }
}
