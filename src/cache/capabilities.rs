//! Advertised peer capabilities, indexed both by peer and by the SHA-256
//! hash peers exchange in place of the full list.

use std::collections::HashMap;
use std::net::SocketAddr;

use ring::digest;

use crate::wire::message::Capability;

/// The hash a peer sends standing in for its full capability list, as part
/// of the `CapHashNotKnown` exchange. Per §3, the list is canonically
/// sorted lexicographically before hashing, so two peers advertising the
/// same set in different orders produce the same hash.
pub fn hash_capabilities(caps: &[Capability]) -> [u8; 32] {
    let mut sorted: Vec<&str> = caps.iter().map(|c| c.0.as_str()).collect();
    sorted.sort_unstable();
    let mut joined = String::new();
    for cap in sorted {
        joined.push_str(cap);
        joined.push('\n');
    }
    let digest = digest::digest(&digest::SHA256, joined.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

pub struct CapabilitiesCache {
    by_peer: HashMap<SocketAddr, Vec<Capability>>,
    by_hash: HashMap<[u8; 32], Vec<Capability>>,
    hard_size: usize,
}

impl CapabilitiesCache {
    pub fn new(hard_size: usize) -> Self {
        CapabilitiesCache {
            by_peer: HashMap::new(),
            by_hash: HashMap::new(),
            hard_size,
        }
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    pub fn add(&mut self, peer: SocketAddr, caps: Vec<Capability>) {
        let hash = hash_capabilities(&caps);
        self.by_hash.insert(hash, caps.clone());
        self.by_peer.insert(peer, caps);
        while self.by_peer.len() > self.hard_size {
            let Some(oldest) = self.by_peer.keys().next().copied() else {
                break;
            };
            self.by_peer.remove(&oldest);
        }
    }

    pub fn for_peer(&self, peer: &SocketAddr) -> Option<&[Capability]> {
        self.by_peer.get(peer).map(Vec::as_slice)
    }

    /// Resolve a capability hash a peer sent in place of its full list, as
    /// part of the `CapHashNotKnown` exchange.
    pub fn for_hash(&self, hash: &[u8; 32]) -> Option<&[Capability]> {
        self.by_hash.get(hash).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_hash_resolves_back_to_the_same_capability_list() {
        let mut cache = CapabilitiesCache::new(10);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let caps = vec![Capability::tls_over_tcp()];
        let hash = hash_capabilities(&caps);
        cache.add(peer, caps.clone());

        assert_eq!(cache.for_peer(&peer), Some(caps.as_slice()));
        assert_eq!(cache.for_hash(&hash), Some(caps.as_slice()));
    }

    #[test]
    fn identical_capability_lists_hash_identically() {
        let a = hash_capabilities(&[Capability::tls_over_tcp()]);
        let b = hash_capabilities(&[Capability::tls_over_tcp()]);
        assert_eq!(a, b);
    }

    #[test]
    fn the_same_capabilities_in_a_different_order_hash_identically() {
        let a = Capability(Box::from("urn:x-rains:a"));
        let b = Capability(Box::from("urn:x-rains:b"));
        let forward = hash_capabilities(&[a.clone(), b.clone()]);
        let reversed = hash_capabilities(&[b, a]);
        assert_eq!(forward, reversed);
    }
}
