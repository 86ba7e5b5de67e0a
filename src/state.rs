//! The server's shared, cross-task state: every cache, guarded the way its
//! own access pattern calls for.

use tokio::sync::{Mutex, RwLock};

use crate::cache::assertion::AssertionCache;
use crate::cache::capabilities::CapabilitiesCache;
use crate::cache::connection::ConnectionCache;
use crate::cache::negative_assertion::NegativeAssertionCache;
use crate::cache::pending_key::PendingKeyCache;
use crate::cache::pending_query::PendingQueryCache;
use crate::cache::zone_key::ZoneKeyCache;
use crate::config::Config;

/// Every cache the trust engine, queue workers, reapers and listener share.
///
/// The zone-key cache is read-mostly after startup load, so it takes a
/// `RwLock`; every other cache is mutated roughly as often as it is read
/// and takes a plain `Mutex`.
pub struct Caches {
    pub zone_keys: RwLock<ZoneKeyCache>,
    pub assertions: Mutex<AssertionCache>,
    pub negative_assertions: Mutex<NegativeAssertionCache>,
    pub pending_keys: Mutex<PendingKeyCache>,
    pub pending_queries: Mutex<PendingQueryCache>,
    pub capabilities: Mutex<CapabilitiesCache>,
    pub connections: Mutex<ConnectionCache>,
}

impl Caches {
    pub fn new(config: &Config) -> Self {
        Caches {
            zone_keys: RwLock::new(ZoneKeyCache::new(
                config.max_public_keys_per_zone,
                config.zone_key_cache_size,
                config.zone_key_cache_warn_size,
            )),
            assertions: Mutex::new(AssertionCache::new(
                config.assertion_cache_hard_size,
                config.assertion_cache_warn_size,
            )),
            negative_assertions: Mutex::new(NegativeAssertionCache::new(
                config.negative_assertion_cache_hard_size,
            )),
            pending_keys: Mutex::new(PendingKeyCache::new(config.pending_key_cache_hard_size)),
            pending_queries: Mutex::new(PendingQueryCache::new(config.pending_query_cache_hard_size)),
            capabilities: Mutex::new(CapabilitiesCache::new(config.capabilities_cache_hard_size)),
            connections: Mutex::new(ConnectionCache::new()),
        }
    }
}
