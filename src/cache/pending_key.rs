//! Sections blocked awaiting a delegation key.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::wire::message::{Context, Section, SignatureAlgorithm, ZoneName};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PendingKeyId {
    pub zone: ZoneName,
    pub context: Context,
    pub key_phase: u32,
}

/// One section parked awaiting `key_id`'s delegation.
pub struct Parked {
    pub section: Section,
    pub source: SocketAddr,
    pub arrived_at: i64,
}

struct Entry {
    parked: Vec<Parked>,
    query_outstanding: bool,
    algorithm: SignatureAlgorithm,
}

pub struct PendingKeyCache {
    entries: HashMap<PendingKeyId, Entry>,
    hard_size: usize,
}

impl PendingKeyCache {
    pub fn new(hard_size: usize) -> Self {
        PendingKeyCache {
            entries: HashMap::new(),
            hard_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|e| e.parked.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park a section, returning whether a delegation query must be issued
    /// (`true` the first time a key is awaited, `false` if one is already
    /// outstanding).
    pub fn park(
        &mut self,
        id: PendingKeyId,
        algorithm: SignatureAlgorithm,
        section: Section,
        source: SocketAddr,
        now: i64,
    ) -> Result<bool, &'static str> {
        if !self.entries.contains_key(&id) && self.len() >= self.hard_size {
            return Err("pending-key cache is at capacity");
        }
        let entry = self.entries.entry(id).or_insert_with(|| Entry {
            parked: Vec::new(),
            query_outstanding: false,
            algorithm,
        });
        entry.parked.push(Parked {
            section,
            source,
            arrived_at: now,
        });
        let should_query = !entry.query_outstanding;
        entry.query_outstanding = true;
        Ok(should_query)
    }

    /// Release every section waiting on `id`, e.g. once the delegation
    /// arrives. Returns `None` if nothing was parked on it.
    pub fn release(&mut self, id: &PendingKeyId) -> Option<Vec<Parked>> {
        self.entries.remove(id).map(|e| e.parked)
    }

    /// Drop every parked section older than `max_age`, returning each one
    /// alongside the key id it was waiting on so the caller can notify its
    /// sender. An id whose every section is still fresh is left in place;
    /// one whose remaining sections all time out is removed entirely.
    pub fn remove_expired(&mut self, now: i64, max_age: i64) -> Vec<(PendingKeyId, Vec<Parked>)> {
        let mut timed_out = Vec::new();
        self.entries.retain(|id, entry| {
            let stale: Vec<Parked> = {
                let mut kept = Vec::new();
                let mut stale = Vec::new();
                for p in entry.parked.drain(..) {
                    if now - p.arrived_at >= max_age {
                        stale.push(p);
                    } else {
                        kept.push(p);
                    }
                }
                entry.parked = kept;
                stale
            };
            if !stale.is_empty() {
                timed_out.push((id.clone(), stale));
            }
            !entry.parked.is_empty()
        });
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;
    use crate::wire::message::{Notification, NotificationCode};

    fn id() -> PendingKeyId {
        PendingKeyId {
            zone: "ch".into(),
            context: Context::default_context(),
            key_phase: 0,
        }
    }

    fn dummy_section() -> Section {
        Section::Notification(Notification {
            token: Token::random(),
            code: NotificationCode::Heartbeat,
            data: "".into(),
        })
    }

    #[test]
    fn only_the_first_parked_section_requests_a_delegation_query() {
        let mut cache = PendingKeyCache::new(10);
        let source: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let first = cache
            .park(id(), SignatureAlgorithm::Ed25519, dummy_section(), source, 0)
            .unwrap();
        let second = cache
            .park(id(), SignatureAlgorithm::Ed25519, dummy_section(), source, 1)
            .unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(cache.release(&id()).unwrap().len(), 2);
    }
}
