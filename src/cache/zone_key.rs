//! Trusted public keys per (zone, context, key-phase).

use std::collections::HashMap;
use std::io;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::wire::message::{Context, PublicKey, SignatureAlgorithm, ZoneName};

#[derive(Serialize, Deserialize)]
struct Record {
    zone: ZoneName,
    context: Context,
    key: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ZoneContext {
    zone: ZoneName,
    context: Context,
}

/// One cached key plus the global insertion clock it was last touched at,
/// so the global hard-size eviction below can pick the least-recently-used
/// entry across every zone.
struct Entry {
    key: PublicKey,
    last_used: u64,
}

/// The zone-key cache: trusted delegation keys, capped two ways — a
/// per-zone `MaxPublicKeysPerZone` governing a single zone's key rotation
/// history, and a global `ZoneKeyCacheSize` hard bound (§4.3) evicting the
/// least-recently-used key across all zones once the total crosses it.
pub struct ZoneKeyCache {
    by_zone: HashMap<ZoneContext, Vec<Entry>>,
    max_per_zone: usize,
    hard_size: usize,
    warn_size: usize,
    clock: u64,
}

impl ZoneKeyCache {
    pub fn new(max_per_zone: usize, hard_size: usize, warn_size: usize) -> Self {
        ZoneKeyCache {
            by_zone: HashMap::new(),
            max_per_zone,
            hard_size,
            warn_size,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_zone.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a key to the zone's key set, evicting the soonest-expiring key
    /// if that pushes the zone over `max_per_zone`, then evicting the
    /// globally least-recently-used key across every zone until the total
    /// is at or under `hard_size`. Warns once the total reaches `warn_size`.
    pub fn add(&mut self, zone: ZoneName, context: Context, key: PublicKey) {
        self.clock += 1;
        let clock = self.clock;
        let slot = self.by_zone.entry(ZoneContext { zone, context }).or_default();
        slot.push(Entry { key, last_used: clock });
        while slot.len() > self.max_per_zone {
            let soonest = slot
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.key.valid_until)
                .map(|(i, _)| i);
            let Some(i) = soonest else { break };
            slot.remove(i);
        }

        self.evict_to_hard_size();

        let size = self.len();
        if size >= self.warn_size {
            warn!(size, warn_size = self.warn_size, "zone-key cache at or above warn size");
        }
    }

    /// Evict the globally least-recently-used key, across every zone,
    /// until the total entry count is at or under `hard_size`.
    fn evict_to_hard_size(&mut self) {
        while self.len() > self.hard_size {
            let lru = self
                .by_zone
                .iter()
                .flat_map(|(zc, entries)| {
                    entries
                        .iter()
                        .enumerate()
                        .map(move |(i, e)| (zc.clone(), i, e.last_used))
                })
                .min_by_key(|(_, _, last_used)| *last_used);
            let Some((zc, i, _)) = lru else { break };
            if let Some(slot) = self.by_zone.get_mut(&zc) {
                slot.remove(i);
                if slot.is_empty() {
                    self.by_zone.remove(&zc);
                }
            }
        }
    }

    /// The latest-expiring key matching `(zone, context, key_phase,
    /// algorithm)` whose validity window overlaps `now`, if any.
    pub fn lookup(
        &self,
        zone: &ZoneName,
        context: &Context,
        key_phase: u32,
        algorithm: SignatureAlgorithm,
        now: i64,
    ) -> Option<&PublicKey> {
        let slot = self.by_zone.get(&ZoneContext {
            zone: zone.clone(),
            context: context.clone(),
        })?;
        slot.iter()
            .map(|e| &e.key)
            .filter(|k| {
                k.key_phase == key_phase
                    && k.algorithm == algorithm
                    && k.valid_since <= now
                    && now <= k.valid_until
            })
            .max_by_key(|k| k.valid_until)
    }

    pub fn remove_expired(&mut self, now: i64) -> usize {
        let mut removed = 0;
        for slot in self.by_zone.values_mut() {
            let before = slot.len();
            slot.retain(|e| e.key.valid_until > now);
            removed += before - slot.len();
        }
        self.by_zone.retain(|_, slot| !slot.is_empty());
        removed
    }

    /// Persist every key to `path` as a CBOR-encoded record stream,
    /// replacing the file atomically.
    pub fn checkpoint(&self, path: &Utf8Path) -> io::Result<()> {
        let records: Vec<Record> = self
            .by_zone
            .iter()
            .flat_map(|(zc, entries)| {
                entries.iter().map(|e| Record {
                    zone: zc.zone.clone(),
                    context: zc.context.clone(),
                    key: e.key.clone(),
                })
            })
            .collect();
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&records, &mut bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        crate::util::write_file(path, &bytes)
    }

    /// Load a checkpoint written by [`Self::checkpoint`], adding each
    /// record back through [`Self::add`] so the per-zone cap is enforced.
    pub fn restore(&mut self, path: &Utf8Path) -> io::Result<()> {
        let bytes = std::fs::read(path)?;
        let records: Vec<Record> = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for record in records {
            self.add(record.zone, record.context, record.key);
        }
        Ok(())
    }
}
