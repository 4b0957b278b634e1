use registry_common::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A mapping from peer id to a monotonic, non-negative logical counter.
///
/// All operations are value-returning: there is no in-place mutation, so a
/// clock can be freely cloned and shared across readers without locking.
/// Equality and hashing ignore zero-valued entries, so `{p: 0}` and `{}` are
/// indistinguishable — a peer that has never incremented its counter is the
/// same as a peer that was never mentioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorClock {
    counters: HashMap<PeerId, u64>,
}

impl VectorClock {
    /// An empty clock; every peer reads as 0.
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    /// A clock with a single peer already at the given count.
    pub fn with_peer(peer: PeerId, count: u64) -> Self {
        let mut counters = HashMap::new();
        if count != 0 {
            counters.insert(peer, count);
        }
        Self { counters }
    }

    /// Current counter for a peer; unseen peers read as 0.
    pub fn get(&self, peer: &PeerId) -> u64 {
        self.counters.get(peer).copied().unwrap_or(0)
    }

    /// A new clock with `peer`'s counter one higher than in `self`.
    pub fn increment(&self, peer: &PeerId) -> Self {
        let mut counters = self.counters.clone();
        let next = self.get(peer) + 1;
        counters.insert(peer.clone(), next);
        Self { counters }
    }

    /// Pointwise maximum of `self` and `other`.
    pub fn merge(&self, other: &VectorClock) -> Self {
        let mut counters = self.counters.clone();
        for (peer, &count) in &other.counters {
            let entry = counters.entry(peer.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        counters.retain(|_, &mut count| count != 0);
        Self { counters }
    }

    /// `self` happened-before `other`: every component `<=`, at least one `<`.
    pub fn is_before(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }

    /// `self` happened-after `other`, i.e. `other.is_before(self)`.
    pub fn is_after(&self, other: &VectorClock) -> bool {
        other.is_before(self)
    }

    /// Neither happened-before the other: a genuine conflict.
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other).is_none()
    }

    /// `Less`/`Greater`/`Equal` per happens-before, `None` if concurrent.
    pub fn compare(&self, other: &VectorClock) -> Option<Ordering> {
        let mut less_or_equal = true;
        let mut greater_or_equal = true;

        for peer in self.all_peers(other) {
            match self.get(&peer).cmp(&other.get(&peer)) {
                Ordering::Less => greater_or_equal = false,
                Ordering::Greater => less_or_equal = false,
                Ordering::Equal => {}
            }
            if !less_or_equal && !greater_or_equal {
                return None;
            }
        }

        match (less_or_equal, greater_or_equal) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    /// All peers this clock has a non-zero counter for.
    pub fn peers(&self) -> Vec<PeerId> {
        self.counters.keys().cloned().collect()
    }

    fn all_peers(&self, other: &VectorClock) -> std::collections::HashSet<PeerId> {
        self.counters
            .keys()
            .chain(other.counters.keys())
            .cloned()
            .collect()
    }

    /// Serialize for gossip transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, registry_common::RegistryError> {
        bincode::serialize(self)
            .map_err(|e| registry_common::RegistryError::Serialization(e.to_string()))
    }

    /// Deserialize a clock received over gossip.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, registry_common::RegistryError> {
        bincode::deserialize(bytes)
            .map_err(|e| registry_common::RegistryError::Serialization(e.to_string()))
    }
}

impl Default for VectorClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Ignores zero-valued entries so a never-incremented peer is indistinguishable
/// from an absent one.
impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.all_peers(other)
            .iter()
            .all(|peer| self.get(peer) == other.get(peer))
    }
}

impl Eq for VectorClock {}

impl std::hash::Hash for VectorClock {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let mut entries: Vec<_> = self
            .counters
            .iter()
            .filter(|(_, &count)| count != 0)
            .collect();
        entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        for (peer, count) in entries {
            peer.hash(state);
            count.hash(state);
        }
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries: Vec<_> = self.counters.iter().collect();
        entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        write!(f, "VectorClock{{")?;
        for (i, (peer, count)) in entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{peer}: {count}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PeerId {
        PeerId::new(s)
    }

    #[test]
    fn empty_clock_reads_zero() {
        let vc = VectorClock::new();
        assert_eq!(vc.get(&p("a")), 0);
    }

    #[test]
    fn increment_is_immutable_and_monotonic() {
        let vc0 = VectorClock::new();
        let vc1 = vc0.increment(&p("a"));
        let vc2 = vc1.increment(&p("a"));

        assert_eq!(vc0.get(&p("a")), 0);
        assert_eq!(vc1.get(&p("a")), 1);
        assert_eq!(vc2.get(&p("a")), 2);
    }

    #[test]
    fn merge_takes_pointwise_max() {
        let vc1 = VectorClock::new()
            .increment(&p("a"))
            .increment(&p("a"))
            .increment(&p("b"));
        let vc2 = VectorClock::new()
            .increment(&p("a"))
            .increment(&p("b"))
            .increment(&p("b"))
            .increment(&p("c"));

        let merged = vc1.merge(&vc2);
        assert_eq!(merged.get(&p("a")), 2);
        assert_eq!(merged.get(&p("b")), 2);
        assert_eq!(merged.get(&p("c")), 1);
    }

    #[test]
    fn merge_is_commutative_associative_idempotent() {
        let a = VectorClock::new().increment(&p("a")).increment(&p("b"));
        let b = VectorClock::new().increment(&p("b")).increment(&p("c"));
        let c = VectorClock::new().increment(&p("a")).increment(&p("c"));

        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn compare_detects_happens_before() {
        let vc1 = VectorClock::new().increment(&p("a"));
        let vc2 = vc1.increment(&p("a")).increment(&p("b"));

        assert_eq!(vc1.compare(&vc2), Some(Ordering::Less));
        assert!(vc1.is_before(&vc2));
        assert!(vc2.is_after(&vc1));
        assert!(!vc2.is_before(&vc1));
    }

    #[test]
    fn compare_detects_concurrent() {
        let vc1 = VectorClock::new().increment(&p("a")).increment(&p("a"));
        let vc2 = VectorClock::new().increment(&p("b")).increment(&p("b"));

        assert_eq!(vc1.compare(&vc2), None);
        assert!(vc1.is_concurrent(&vc2));
        assert!(vc2.is_concurrent(&vc1));
        assert!(!vc1.is_before(&vc2));
        assert!(!vc1.is_after(&vc2));
    }

    #[test]
    fn is_before_is_a_strict_partial_order() {
        let a = VectorClock::new().increment(&p("x"));
        let b = a.increment(&p("x"));
        let c = b.increment(&p("x"));

        // irreflexive
        assert!(!a.is_before(&a));
        // transitive
        assert!(a.is_before(&b));
        assert!(b.is_before(&c));
        assert!(a.is_before(&c));
        // antisymmetric: can't be before and after
        assert!(!(a.is_before(&b) && b.is_before(&a)));
    }

    #[test]
    fn equality_ignores_zero_entries() {
        let explicit_zero = VectorClock::with_peer(p("a"), 0);
        let empty = VectorClock::new();
        assert_eq!(explicit_zero, empty);

        let mut hasher_a = std::collections::hash_map::DefaultHasher::new();
        let mut hasher_b = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        explicit_zero.hash(&mut hasher_a);
        empty.hash(&mut hasher_b);
        assert_eq!(hasher_a.finish(), hasher_b.finish());
    }

    #[test]
    fn serialization_roundtrips() {
        let vc = VectorClock::new().increment(&p("a")).increment(&p("b"));
        let bytes = vc.to_bytes().unwrap();
        let restored = VectorClock::from_bytes(&bytes).unwrap();
        assert_eq!(vc, restored);
    }
}
