//! Proofs of nonexistence: shards/pshards keyed by (context, zone) and
//! indexed by their covered range.

use std::collections::HashMap;
use std::io;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::wire::message::{Context, Pshard, Shard, ZoneName};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ZoneContext {
    zone: ZoneName,
    context: Context,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NegativeEntry {
    Shard(Shard),
    Pshard(Pshard),
}

impl NegativeEntry {
    fn range(&self) -> (&str, &str) {
        match self {
            NegativeEntry::Shard(s) => (&s.range_from, &s.range_to),
            NegativeEntry::Pshard(p) => (&p.range_from, &p.range_to),
        }
    }

    fn covers(&self, name: &str) -> bool {
        let (from, to) = self.range();
        let after_from = from.is_empty() || name >= from;
        let before_to = to.is_empty() || name < to;
        after_from && before_to
    }

    fn signatures(&self) -> &[crate::wire::message::Signature] {
        match self {
            NegativeEntry::Shard(s) => &s.signatures,
            NegativeEntry::Pshard(p) => &p.signatures,
        }
    }

    /// The tightest `valid_until` across this entry's signatures, i.e. the
    /// point after which every signature covering it has expired.
    fn expires_at(&self) -> Option<i64> {
        self.signatures().iter().map(|s| s.valid_until).min()
    }
}

/// A per-(zone, context) list of ranges. Kept as a flat `Vec` rather than a
/// balanced interval tree: entry counts per zone are small (bounded by
/// `MaxPublicKeysPerZone`-scale configuration, not by the size of the name
/// space), so a linear scan on lookup is not a hot path.
pub struct NegativeAssertionCache {
    by_zone: HashMap<ZoneContext, Vec<NegativeEntry>>,
    hard_size: usize,
}

impl NegativeAssertionCache {
    pub fn new(hard_size: usize) -> Self {
        NegativeAssertionCache {
            by_zone: HashMap::new(),
            hard_size,
        }
    }

    pub fn len(&self) -> usize {
        self.by_zone.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, zone: ZoneName, context: Context, entry: NegativeEntry) {
        let slot = self.by_zone.entry(ZoneContext { zone, context }).or_default();
        slot.push(entry);
        while slot.len() > self.hard_size {
            slot.remove(0);
        }
    }

    /// Any shard/pshard proving `name` does not exist in `(zone, context)`.
    pub fn lookup(&self, zone: &ZoneName, context: &Context, name: &str) -> Option<&NegativeEntry> {
        let slot = self.by_zone.get(&ZoneContext {
            zone: zone.clone(),
            context: context.clone(),
        })?;
        slot.iter().find(|entry| entry.covers(name))
    }

    /// Drop every entry whose signatures have all expired by `now`.
    pub fn remove_expired(&mut self, now: i64) -> usize {
        let mut removed = 0;
        for slot in self.by_zone.values_mut() {
            let before = slot.len();
            slot.retain(|e| e.expires_at().is_none_or(|until| until > now));
            removed += before - slot.len();
        }
        self.by_zone.retain(|_, slot| !slot.is_empty());
        removed
    }

    pub fn remove_zone(&mut self, zone: &ZoneName, context: &Context) {
        self.by_zone.remove(&ZoneContext {
            zone: zone.clone(),
            context: context.clone(),
        });
    }

    pub fn checkpoint(&self, path: &Utf8Path) -> io::Result<()> {
        let records: Vec<(ZoneName, Context, NegativeEntry)> = self
            .by_zone
            .iter()
            .flat_map(|(zc, entries)| {
                entries
                    .iter()
                    .map(|e| (zc.zone.clone(), zc.context.clone(), e.clone()))
            })
            .collect();
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&records, &mut bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        crate::util::write_file(path, &bytes)
    }

    pub fn restore(&mut self, path: &Utf8Path) -> io::Result<()> {
        let bytes = std::fs::read(path)?;
        let records: Vec<(ZoneName, Context, NegativeEntry)> =
            ciborium::de::from_reader(bytes.as_slice())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for (zone, context, entry) in records {
            self.add(zone, context, entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(from: &str, to: &str) -> NegativeEntry {
        NegativeEntry::Shard(Shard {
            subject_zone: "ch".into(),
            context: Context::default_context(),
            range_from: from.into(),
            range_to: to.into(),
            content: vec![],
            signatures: vec![],
        })
    }

    #[test]
    fn lookup_finds_the_shard_covering_a_name() {
        let mut cache = NegativeAssertionCache::new(10);
        let zone: ZoneName = "ch".into();
        let ctx = Context::default_context();
        cache.add(zone.clone(), ctx.clone(), shard("a", "m"));
        cache.add(zone.clone(), ctx.clone(), shard("m", ""));

        assert!(cache.lookup(&zone, &ctx, "bob").is_some());
        assert!(cache.lookup(&zone, &ctx, "zelda").is_some());
        assert!(cache.lookup(&zone, &ctx, "000").is_none());
    }
}
