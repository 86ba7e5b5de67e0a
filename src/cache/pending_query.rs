//! Queries blocked awaiting an upstream answer, keyed by [`Token`].
//!
//! A second index, by the `(context, zone, name, objectType)` the query
//! asked about, lets the trust engine wake any pending-query entry whose
//! requested name/type an admission now answers, without the caller needing
//! to remember every outstanding query's shape.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::token::Token;
use crate::wire::message::{Context, ObjectType, Query, ZoneName};

/// The natural key an admitted assertion answers; matched against every
/// pending query's requested types to decide who wakes up.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub context: Context,
    pub zone: ZoneName,
    pub name: Box<str>,
    pub object_type: ObjectType,
}

struct Entry {
    query: Query,
    zone_hint: ZoneName,
    waiters: Vec<SocketAddr>,
    arrived_at: i64,
}

pub struct PendingQueryCache {
    entries: HashMap<Token, Entry>,
    by_content: HashMap<ContentKey, Vec<Token>>,
    hard_size: usize,
}

impl PendingQueryCache {
    pub fn new(hard_size: usize) -> Self {
        PendingQueryCache {
            entries: HashMap::new(),
            by_content: HashMap::new(),
            hard_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `waiter` against `token`, remembering `query` and the zone
    /// it was resolved against so a later release can answer it for real.
    /// Returns `true` if this is the first waiter (the caller should
    /// forward the query upstream).
    pub fn add(
        &mut self,
        token: Token,
        query: Query,
        zone_hint: ZoneName,
        waiter: SocketAddr,
        now: i64,
    ) -> Result<bool, &'static str> {
        if !self.entries.contains_key(&token) && self.entries.len() >= self.hard_size {
            return Err("pending-query cache is at capacity");
        }
        let is_first = !self.entries.contains_key(&token);
        if is_first {
            for object_type in content_types(&query) {
                let key = ContentKey {
                    context: query.context.clone(),
                    zone: zone_hint.clone(),
                    name: query.name.clone(),
                    object_type,
                };
                self.by_content.entry(key).or_default().push(token);
            }
        }
        let entry = self.entries.entry(token).or_insert_with(|| Entry {
            query,
            zone_hint,
            waiters: Vec::new(),
            arrived_at: now,
        });
        entry.waiters.push(waiter);
        Ok(is_first)
    }

    /// The waiters and original query registered against `token`, removing
    /// the entry (and its content-index rows) entirely.
    pub fn take(&mut self, token: &Token) -> Option<(Query, ZoneName, Vec<SocketAddr>)> {
        let entry = self.entries.remove(token)?;
        self.unindex(token, &entry.query, &entry.zone_hint);
        Some((entry.query, entry.zone_hint, entry.waiters))
    }

    /// Every token whose pending query is answered by `key`, without
    /// consuming them — the caller still calls [`Self::take`] per token to
    /// fetch its waiters and reply.
    pub fn tokens_awaiting(&self, key: &ContentKey) -> Vec<Token> {
        self.by_content.get(key).cloned().unwrap_or_default()
    }

    pub fn remove_expired(&mut self, now: i64, max_age: i64) -> Vec<(Token, Query, ZoneName, Vec<SocketAddr>)> {
        let mut timed_out = Vec::new();
        let stale: Vec<Token> = self
            .entries
            .iter()
            .filter(|(_, e)| now - e.arrived_at >= max_age)
            .map(|(t, _)| *t)
            .collect();
        for token in stale {
            if let Some((query, zone, waiters)) = self.take(&token) {
                timed_out.push((token, query, zone, waiters));
            }
        }
        timed_out
    }

    fn unindex(&mut self, token: &Token, query: &Query, zone_hint: &ZoneName) {
        for object_type in content_types(query) {
            let key = ContentKey {
                context: query.context.clone(),
                zone: zone_hint.clone(),
                name: query.name.clone(),
                object_type,
            };
            if let Some(tokens) = self.by_content.get_mut(&key) {
                tokens.retain(|t| t != token);
                if tokens.is_empty() {
                    self.by_content.remove(&key);
                }
            }
        }
    }
}

/// The object types a query's eventual answer must be indexed under. An
/// empty `types` list leaves "any type" implicit and falls back to `Name`,
/// mirroring `server::answer_query`'s own default.
fn content_types(query: &Query) -> Vec<ObjectType> {
    if query.types.is_empty() {
        vec![ObjectType::Name]
    } else {
        query.types.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::Context;

    fn query(name: &str) -> Query {
        Query {
            name: name.into(),
            context: Context::default_context(),
            expiration: 1_000,
            types: vec![ObjectType::Ip4],
            options: vec![],
        }
    }

    #[test]
    fn only_the_first_waiter_triggers_a_forward() {
        let mut cache = PendingQueryCache::new(10);
        let token = Token::random();
        let zone: ZoneName = "ch".into();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();

        assert!(cache.add(token, query("www"), zone.clone(), a, 0).unwrap());
        assert!(!cache.add(token, query("www"), zone, b, 0).unwrap());
        let (_, _, waiters) = cache.take(&token).unwrap();
        assert_eq!(waiters, vec![a, b]);
        assert!(cache.take(&token).is_none());
    }

    #[test]
    fn a_matching_content_key_finds_the_waiting_token() {
        let mut cache = PendingQueryCache::new(10);
        let token = Token::random();
        let zone: ZoneName = "ch".into();
        cache
            .add(token, query("www"), zone.clone(), "127.0.0.1:1".parse().unwrap(), 0)
            .unwrap();

        let key = ContentKey {
            context: Context::default_context(),
            zone,
            name: "www".into(),
            object_type: ObjectType::Ip4,
        };
        assert_eq!(cache.tokens_awaiting(&key), vec![token]);
    }

    #[test]
    fn reaping_drops_entries_older_than_max_age_and_clears_the_content_index() {
        let mut cache = PendingQueryCache::new(10);
        let token = Token::random();
        let zone: ZoneName = "ch".into();
        cache
            .add(token, query("www"), zone.clone(), "127.0.0.1:1".parse().unwrap(), 0)
            .unwrap();

        let timed_out = cache.remove_expired(100, 50);
        assert_eq!(timed_out.len(), 1);
        assert!(cache.is_empty());
        let key = ContentKey {
            context: Context::default_context(),
            zone,
            name: "www".into(),
            object_type: ObjectType::Ip4,
        };
        assert!(cache.tokens_awaiting(&key).is_empty());
    }
}
