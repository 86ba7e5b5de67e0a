//! Positive answers: assertions keyed by (context, zone, name, objectType).
//! An assertion with several object types is indexed under each type it can
//! answer, sharing one allocation via `Arc`.

use std::io;
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::cache::BoundedCache;
use crate::wire::message::{Assertion, Context, ObjectType, ZoneName};

#[derive(Serialize, Deserialize)]
struct Record {
    assertion: Assertion,
    valid_until: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AssertionKey {
    context: Context,
    zone: ZoneName,
    name: Box<str>,
    object_type: ObjectType,
}

pub struct AssertionCache {
    entries: BoundedCache<AssertionKey, Arc<Assertion>>,
}

impl AssertionCache {
    pub fn new(hard_size: usize, warn_size: usize) -> Self {
        AssertionCache {
            entries: BoundedCache::new(hard_size, warn_size),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index `assertion` under every object type it carries. `valid_until`
    /// is the assertion's effective validity, already capped by the trust
    /// engine against its signing key's window. Returns the shared handle
    /// so callers (the trust engine's pending-query wake-up) can inspect
    /// what was just admitted without a second lookup.
    pub fn add(&mut self, assertion: Assertion, valid_until: Option<i64>) -> Arc<Assertion> {
        let shared = Arc::new(assertion);
        let object_types: Vec<ObjectType> = shared
            .objects
            .iter()
            .map(|o| o.object_type())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for object_type in object_types {
            let key = AssertionKey {
                context: shared.context.clone(),
                zone: shared.subject_zone.clone(),
                name: shared.subject_name.clone(),
                object_type,
            };
            self.entries.add(key, Arc::clone(&shared), valid_until);
        }
        shared
    }

    pub fn get(
        &mut self,
        context: &Context,
        zone: &ZoneName,
        name: &str,
        object_type: ObjectType,
    ) -> Option<&Assertion> {
        let key = AssertionKey {
            context: context.clone(),
            zone: zone.clone(),
            name: name.into(),
            object_type,
        };
        self.entries.get(&key).map(|a| a.as_ref())
    }

    pub fn remove_expired(&mut self, now: i64) -> usize {
        self.entries.remove_expired(now)
    }

    /// Persist every distinct assertion (deduplicated across its
    /// object-type indices) to `path`, replacing the file atomically.
    pub fn checkpoint(&self, path: &Utf8Path) -> io::Result<()> {
        let mut seen: Vec<*const Assertion> = Vec::new();
        let mut records = Vec::new();
        for (_, assertion, valid_until) in self.entries.iter_with_expiry() {
            let ptr = Arc::as_ptr(assertion);
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            records.push(Record {
                assertion: (**assertion).clone(),
                valid_until,
            });
        }
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&records, &mut bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        crate::util::write_file(path, &bytes)
    }

    pub fn restore(&mut self, path: &Utf8Path) -> io::Result<()> {
        let bytes = std::fs::read(path)?;
        let records: Vec<Record> = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for record in records {
            self.add(record.assertion, record.valid_until);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::Object;

    fn assertion(name: &str) -> Assertion {
        Assertion {
            subject_zone: "ch".into(),
            context: Context::default_context(),
            subject_name: name.into(),
            objects: vec![
                Object::Ip4(std::net::Ipv4Addr::new(1, 2, 3, 4)),
                Object::Name("other.ch".into()),
            ],
            signatures: vec![],
        }
    }

    #[test]
    fn an_assertion_answers_every_object_type_it_carries() {
        let mut cache = AssertionCache::new(10, 10);
        cache.add(assertion("www"), Some(1000));

        let ctx = Context::default_context();
        let zone: ZoneName = "ch".into();
        assert!(cache.get(&ctx, &zone, "www", ObjectType::Ip4).is_some());
        assert!(cache.get(&ctx, &zone, "www", ObjectType::Name).is_some());
        assert!(cache
            .get(&ctx, &zone, "www", ObjectType::Certificate)
            .is_none());
    }
}
