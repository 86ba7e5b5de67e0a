//! The trust engine: the seven-step pipeline applied to each inbound
//! signable section.
//!
//! The final step's "awaken any pending-query entries" and the pending-key
//! graph ("a released section may itself contain a delegation that releases
//! more pending-key entries") are the two pieces that tie the whole engine
//! together: admitting an assertion can supply the very key another parked
//! section was waiting on, which in turn may admit assertions that supply
//! further keys. [`TrustEngine::process`] drives that to a fixpoint with a
//! worklist rather than recursion, since async fns cannot call themselves
//! without boxing.

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::cache::negative_assertion::NegativeEntry;
use crate::cache::pending_key::{Parked, PendingKeyId};
use crate::cache::pending_query::ContentKey;
use crate::config::Config;
use crate::crypto;
use crate::metrics::Metrics;
use crate::state::Caches;
use crate::token::Token;
use crate::util::now_secs;
use crate::wire::canonical::encode_section_body;
use crate::wire::message::{
    Assertion, Context, Notification, NotificationCode, Object, Section, Shard, Signature, Zone,
    ZoneContent, ZoneName,
};

/// What became of a section after the pipeline ran.
pub enum Outcome {
    /// Admitted into the appropriate cache; `wake` lists pending-query
    /// tokens whose buffered replies can now be released (step 7).
    Admitted { wake: Vec<Token> },
    /// Parked awaiting a delegation key; `issue_query` is `true` the first
    /// time this key is awaited (caller should send a delegation query).
    Parked { issue_query: bool },
    /// Failed the consistency check.
    Inconsistent(String),
    /// Every signature failed to verify (or none were present).
    Unverified,
    /// A signable section this pipeline does not key-lookup for: the
    /// zone-key cache is keyed by zone name, and address-scoped sections
    /// (`AddressAssertion`, `AddressZone`) carry no zone. Address-scoped
    /// delegation is left for a future address-key cache (see DESIGN.md).
    Unsupported,
}

/// The outcome of steps 3-6 alone, for one section — either freshly
/// arrived or released from the pending-key cache. Distinct from
/// [`Outcome`] because the worklist driving step 7's fixpoint needs the
/// raw `new_keys` a [`Outcome::Admitted`] doesn't expose.
enum VerifyOutcome {
    Admitted { wake: Vec<Token>, new_keys: Vec<PendingKeyId> },
    Parked { issue_query: bool },
    /// The pending-key cache rejected the park (it is full).
    CapacityExceeded,
    Unverified,
}

pub struct TrustEngine<'a> {
    pub caches: &'a Caches,
    pub config: &'a Config,
    pub metrics: &'a Metrics,
}

impl<'a> TrustEngine<'a> {
    /// Run the full pipeline for one section arriving from `source`.
    /// Step 1 (sort) is assumed already applied at the message level
    /// before a section reaches the trust engine.
    pub async fn process(&self, section: Section, source: SocketAddr) -> Outcome {
        if let Err(detail) = check_consistency(&section) {
            warn!(%detail, "section failed consistency check");
            return Outcome::Inconsistent(detail);
        }

        if section.signatures().is_none() {
            // Query/AddressQuery/Notification are unsigned and pass
            // straight to ingest semantics handled by the caller; the
            // trust engine only gates signable sections.
            return Outcome::Admitted { wake: vec![] };
        }
        if section.context().is_none() {
            return Outcome::Unverified;
        }
        if section.subject_zone().is_none() {
            return Outcome::Unsupported;
        }

        match self.verify_and_ingest(section, source).await {
            VerifyOutcome::Unverified => Outcome::Unverified,
            VerifyOutcome::CapacityExceeded => Outcome::Inconsistent("pending-key cache is full".into()),
            VerifyOutcome::Parked { issue_query } => Outcome::Parked { issue_query },
            VerifyOutcome::Admitted { mut wake, new_keys } => {
                self.release_to_fixpoint(new_keys, &mut wake).await;
                wake.sort_by_key(|t| t.0);
                wake.dedup();
                Outcome::Admitted { wake }
            }
        }
    }

    /// Steps 3-6 for a single zone-scoped signable section: locate a
    /// matching zone-key for every signature (parking on the first miss),
    /// verify, tighten validity, and ingest. Used both for freshly arrived
    /// sections and for sections released from the pending-key cache.
    async fn verify_and_ingest(&self, section: Section, source: SocketAddr) -> VerifyOutcome {
        let signatures = match section.signatures() {
            Some(sigs) if !sigs.is_empty() => sigs.to_vec(),
            Some(_) => return VerifyOutcome::Unverified,
            None => return VerifyOutcome::Admitted { wake: vec![], new_keys: vec![] },
        };
        let Some(context) = section.context().cloned() else {
            return VerifyOutcome::Unverified;
        };
        let Some(zone) = section.subject_zone().cloned() else {
            return VerifyOutcome::Unverified;
        };

        let now = now_secs();
        let mut matched: Vec<(Signature, i64, i64, crate::wire::message::PublicKey)> = Vec::new();
        let mut missing: Option<&Signature> = None;
        {
            let zone_keys = self.caches.zone_keys.read().await;
            for sig in &signatures {
                match zone_keys.lookup(&zone, &context, sig.key_phase, sig.algorithm, now) {
                    Some(key) => matched.push((
                        sig.clone(),
                        key.valid_since.max(sig.valid_since),
                        key.valid_until.min(sig.valid_until),
                        key.clone(),
                    )),
                    None => {
                        missing = Some(sig);
                        break;
                    }
                }
            }
        }
        if let Some(sig) = missing {
            return self.park(zone, context, sig, section, source, now).await;
        }

        let body = encode_section_body(&section);
        let mut live_window: Option<(i64, i64)> = None;
        let mut any_verified = false;
        for (sig, since, until, key) in &matched {
            if crypto::verify(key, &body, sig) {
                any_verified = true;
                self.metrics.sections_verified.inc();
                live_window = Some(match live_window {
                    None => (*since, *until),
                    Some((s, u)) => (s.max(*since), u.min(*until)),
                });
            }
        }

        if !any_verified {
            self.metrics.sections_dropped_unverified.inc();
            debug!("all signatures failed verification, dropping section");
            return VerifyOutcome::Unverified;
        }

        let (_, until) = live_window.expect("any_verified implies a window was recorded");
        let max_valid_until = now + self.config.max_cache_validity_hours * 3600;
        let effective_until = until.min(max_valid_until);

        let mut wake = Vec::new();
        let mut new_keys = Vec::new();
        self.ingest_section(section, effective_until, &mut wake, &mut new_keys).await;
        VerifyOutcome::Admitted { wake, new_keys }
    }

    async fn park(
        &self,
        zone: ZoneName,
        context: Context,
        sig: &Signature,
        section: Section,
        source: SocketAddr,
        now: i64,
    ) -> VerifyOutcome {
        let id = PendingKeyId {
            zone,
            context,
            key_phase: sig.key_phase,
        };
        let mut pending = self.caches.pending_keys.lock().await;
        match pending.park(id, sig.algorithm, section, source, now) {
            Ok(issue_query) => {
                self.metrics.sections_parked_pending_key.inc();
                if issue_query {
                    self.metrics.delegation_queries_sent.inc();
                }
                VerifyOutcome::Parked { issue_query }
            }
            Err(_) => VerifyOutcome::CapacityExceeded,
        }
    }

    /// Iterates to a fixpoint: a delegation admitted along the way may
    /// itself be the key another parked section needs. Drains a worklist of newly
    /// available `(zone, context, key-phase)` ids, re-running steps 3-6 on
    /// every section that was parked on each one, until nothing more
    /// unlocks.
    async fn release_to_fixpoint(&self, seed: Vec<PendingKeyId>, wake: &mut Vec<Token>) {
        let mut worklist: VecDeque<PendingKeyId> = seed.into();
        while let Some(id) = worklist.pop_front() {
            let Some(parked) = self.caches.pending_keys.lock().await.release(&id) else {
                continue;
            };
            for entry in parked {
                self.reverify_parked(entry, wake, &mut worklist).await;
            }
        }
    }

    async fn reverify_parked(&self, parked: Parked, wake: &mut Vec<Token>, worklist: &mut VecDeque<PendingKeyId>) {
        let Parked { section, source, .. } = parked;
        match self.verify_and_ingest(section, source).await {
            VerifyOutcome::Admitted { wake: more_wake, new_keys } => {
                wake.extend(more_wake);
                worklist.extend(new_keys);
            }
            VerifyOutcome::Parked { .. } => {
                // Still missing a different key; `verify_and_ingest` has
                // already re-parked it under that key's id.
            }
            VerifyOutcome::CapacityExceeded => {
                warn!("pending-key cache is full while releasing a fixpoint round");
            }
            VerifyOutcome::Unverified => {
                debug!("a released section failed verification against its now-available key");
            }
        }
    }

    async fn ingest_section(
        &self,
        section: Section,
        valid_until: i64,
        wake: &mut Vec<Token>,
        new_keys: &mut Vec<PendingKeyId>,
    ) {
        match section {
            Section::Assertion(a) => self.ingest_assertion(a, valid_until, wake, new_keys).await,
            Section::Zone(z) => {
                let zone = z.subject_zone.clone();
                let context = z.context.clone();
                for content in z.content {
                    match content {
                        ZoneContent::Assertion(a) => {
                            self.ingest_assertion(a, valid_until, wake, new_keys).await
                        }
                        ZoneContent::Shard(s) => {
                            for assertion in s.content.clone() {
                                self.ingest_assertion(assertion, valid_until, wake, new_keys).await;
                            }
                            self.caches.negative_assertions.lock().await.add(
                                zone.clone(),
                                context.clone(),
                                NegativeEntry::Shard(s),
                            );
                        }
                        ZoneContent::Pshard(p) => {
                            self.caches.negative_assertions.lock().await.add(
                                zone.clone(),
                                context.clone(),
                                NegativeEntry::Pshard(p),
                            );
                        }
                    }
                }
            }
            Section::Shard(s) => {
                let zone = s.subject_zone.clone();
                let context = s.context.clone();
                for assertion in s.content.clone() {
                    self.ingest_assertion(assertion, valid_until, wake, new_keys).await;
                }
                self.caches
                    .negative_assertions
                    .lock()
                    .await
                    .add(zone, context, NegativeEntry::Shard(s));
            }
            other => {
                warn!("ingest received a section kind the trust engine does not admit directly");
                let _ = other;
            }
        }
    }

    /// Admit one assertion: promote any `Delegation` object it carries
    /// into the zone-key cache (recording its id so the caller can release
    /// anything parked on it), then index the assertion itself and wake
    /// any pending query whose requested name/type it now answers.
    async fn ingest_assertion(
        &self,
        assertion: Assertion,
        valid_until: i64,
        wake: &mut Vec<Token>,
        new_keys: &mut Vec<PendingKeyId>,
    ) {
        for object in &assertion.objects {
            if let Object::Delegation(key) = object {
                let child_zone = delegated_zone(&assertion);
                self.caches
                    .zone_keys
                    .write()
                    .await
                    .add(child_zone.clone(), assertion.context.clone(), key.clone());
                new_keys.push(PendingKeyId {
                    zone: child_zone,
                    context: assertion.context.clone(),
                    key_phase: key.key_phase,
                });
            }
        }

        let shared = self.caches.assertions.lock().await.add(assertion, Some(valid_until));

        let object_types: BTreeSet<_> = shared.objects.iter().map(|o| o.object_type()).collect();
        let mut pending = self.caches.pending_queries.lock().await;
        for object_type in object_types {
            let key = ContentKey {
                context: shared.context.clone(),
                zone: shared.subject_zone.clone(),
                name: shared.subject_name.clone(),
                object_type,
            };
            wake.extend(pending.tokens_awaiting(&key));
        }
    }
}

/// The name of the zone a `Delegation` object hands control of: an
/// assertion for `subjectZone:"."`, `subjectName:"ch"` carrying
/// `[delegation K_ch]` delegates the zone
/// `"ch"`; one for `subjectZone:"ch"`, `subjectName:"example"` would
/// delegate `"example.ch"`.
fn delegated_zone(assertion: &Assertion) -> ZoneName {
    if assertion.subject_zone.0.as_ref() == "." {
        ZoneName(assertion.subject_name.clone())
    } else {
        ZoneName(format!("{}.{}", assertion.subject_name, assertion.subject_zone).into())
    }
}

/// Step 2: a shard's assertions must lie within its declared range; a
/// zone's shards must be non-overlapping and cover the declared range
/// (approximated here as non-overlapping, contiguous sort order, since the
/// zone's own range is the whole name space unless further scoped).
fn check_consistency(section: &Section) -> Result<(), String> {
    match section {
        Section::Shard(s) => check_shard_consistency(s),
        Section::Zone(z) => check_zone_consistency(z),
        _ => Ok(()),
    }
}

fn check_shard_consistency(shard: &Shard) -> Result<(), String> {
    for assertion in &shard.content {
        if !shard.range_contains(&assertion.subject_name) {
            return Err(format!(
                "assertion '{}' lies outside shard range [{}, {})",
                assertion.subject_name, shard.range_from, shard.range_to
            ));
        }
    }
    Ok(())
}

fn check_zone_consistency(zone: &Zone) -> Result<(), String> {
    let mut shard_ranges: Vec<(&str, &str)> = Vec::new();
    for content in &zone.content {
        match content {
            ZoneContent::Shard(s) => {
                check_shard_consistency(s)?;
                shard_ranges.push((&s.range_from, &s.range_to));
            }
            ZoneContent::Pshard(p) => {
                shard_ranges.push((&p.range_from, &p.range_to));
            }
            ZoneContent::Assertion(_) => {}
        }
    }
    shard_ranges.sort_by(|a, b| compare_range_from(a.0, b.0));
    for pair in shard_ranges.windows(2) {
        let (_, prev_to) = pair[0];
        let (next_from, _) = pair[1];
        if !prev_to.is_empty() && !next_from.is_empty() && prev_to > next_from {
            return Err("zone shards overlap".into());
        }
    }
    Ok(())
}

fn compare_range_from(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

/// Build the `RcvInconsistentMsg` notification a peer receives when their
/// section fails step 2.
pub fn inconsistent_notification(token: Token, detail: &str) -> Notification {
    Notification {
        token,
        code: NotificationCode::RcvInconsistentMsg,
        data: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::zone_key::ZoneKeyCache;
    use crate::config::Config;
    use crate::crypto::PrivateKey;
    use crate::state::Caches;
    use crate::wire::message::{KeySpace, Object, PublicKey, SignatureAlgorithm, SignatureData};
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn assertion(name: &str) -> Assertion {
        Assertion {
            subject_zone: "ch".into(),
            context: Context::default_context(),
            subject_name: name.into(),
            objects: vec![Object::Ip4(std::net::Ipv4Addr::new(1, 2, 3, 4))],
            signatures: vec![],
        }
    }

    #[test]
    fn an_assertion_outside_its_shards_range_is_inconsistent() {
        let shard = Shard {
            subject_zone: "ch".into(),
            context: Context::default_context(),
            range_from: "a".into(),
            range_to: "m".into(),
            content: vec![assertion("zelda")],
            signatures: vec![],
        };
        assert!(check_shard_consistency(&shard).is_err());
    }

    #[test]
    fn non_overlapping_shards_in_a_zone_are_consistent() {
        let zone = Zone {
            subject_zone: "ch".into(),
            context: Context::default_context(),
            content: vec![
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".into(),
                    context: Context::default_context(),
                    range_from: "".into(),
                    range_to: "m".into(),
                    content: vec![assertion("bob")],
                    signatures: vec![],
                }),
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".into(),
                    context: Context::default_context(),
                    range_from: "m".into(),
                    range_to: "".into(),
                    content: vec![assertion("zelda")],
                    signatures: vec![],
                }),
            ],
            signatures: vec![],
        };
        assert!(check_zone_consistency(&zone).is_ok());
    }

    #[test]
    fn overlapping_shards_in_a_zone_are_inconsistent() {
        let zone = Zone {
            subject_zone: "ch".into(),
            context: Context::default_context(),
            content: vec![
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".into(),
                    context: Context::default_context(),
                    range_from: "".into(),
                    range_to: "n".into(),
                    content: vec![],
                    signatures: vec![],
                }),
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".into(),
                    context: Context::default_context(),
                    range_from: "m".into(),
                    range_to: "".into(),
                    content: vec![],
                    signatures: vec![],
                }),
            ],
            signatures: vec![],
        };
        assert!(check_zone_consistency(&zone).is_err());
    }

    #[test]
    fn delegated_zone_name_is_the_subject_name_under_the_root() {
        let a = assertion("ch");
        assert_eq!(delegated_zone(&a), ZoneName::from("ch"));
    }

    #[test]
    fn delegated_zone_name_nests_under_a_non_root_parent() {
        let mut a = assertion("example");
        a.subject_zone = "ch".into();
        assert_eq!(delegated_zone(&a), ZoneName::from("example.ch"));
    }

    fn test_config() -> Config {
        Config {
            root_zone_public_key_path: "root.pem".into(),
            server_address: "127.0.0.1:5555".parse().unwrap(),
            keep_alive_period_secs: 60,
            tcp_timeout_secs: 30,
            tls_certificate_file: "cert.pem".into(),
            tls_private_key_file: "key.pem".into(),
            insecure_skip_verify: true,
            msg_max_size: 65535,
            prio_buffer_size: 4,
            normal_buffer_size: 4,
            notification_buffer_size: 4,
            prio_worker_count: 1,
            normal_worker_count: 1,
            notification_worker_count: 1,
            zone_key_cache_size: 10,
            zone_key_cache_warn_size: 8,
            max_public_keys_per_zone: 4,
            assertion_cache_hard_size: 10,
            assertion_cache_warn_size: 8,
            negative_assertion_cache_hard_size: 10,
            pending_key_cache_hard_size: 10,
            pending_query_cache_hard_size: 10,
            capabilities_cache_hard_size: 10,
            capabilities: vec![],
            delegation_query_validity_secs: 600,
            query_validity_secs: 600,
            address_query_validity_secs: 600,
            max_cache_validity_hours: 24,
            context_authority: vec![],
            zone_authority: vec![],
            zone_key_checkpoint_interval_secs: 300,
            assertion_checkpoint_interval_secs: 300,
            negative_assertion_checkpoint_interval_secs: 300,
            check_point_path: "/tmp/rainsd-trust-test".into(),
            pre_load_caches: false,
            reap_verify_timeout_secs: 60,
        }
    }

    fn ed25519_keypair() -> (PrivateKey, PublicKey) {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key = PrivateKey::from_pkcs8(SignatureAlgorithm::Ed25519, pkcs8.as_ref()).unwrap();
        let public = PublicKey {
            algorithm: SignatureAlgorithm::Ed25519,
            key_phase: 0,
            valid_since: 0,
            valid_until: 1_000_000,
            key: key.public_key_bytes(),
        };
        (key, public)
    }

    fn signed_assertion(name: &str, zone: &str, objects: Vec<Object>, key: &PrivateKey) -> Assertion {
        let mut a = Assertion {
            subject_zone: zone.into(),
            context: Context::default_context(),
            subject_name: name.into(),
            objects,
            signatures: vec![Signature {
                key_space: KeySpace::Rains,
                algorithm: SignatureAlgorithm::Ed25519,
                key_phase: 0,
                valid_since: 0,
                valid_until: 1_000_000,
                data: SignatureData::Empty,
            }],
        };
        let body = encode_section_body(&Section::Assertion(a.clone()));
        crate::crypto::sign(key, &body, &mut a.signatures[0]).unwrap();
        a
    }

    #[tokio::test]
    async fn a_deferred_assertion_is_admitted_once_its_key_arrives() {
        let config = test_config();
        let caches = Caches::new(&config);
        let (root_key, root_public) = ed25519_keypair();
        let (ch_key, ch_public) = ed25519_keypair();

        caches
            .zone_keys
            .write()
            .await
            .add(ZoneName::from("."), Context::default_context(), root_public);

        let engine = TrustEngine {
            caches: &caches,
            config: &config,
            metrics: &crate::metrics::Metrics::new(),
        };
        let source: SocketAddr = "127.0.0.1:1".parse().unwrap();

        // The child assertion arrives first, signed by a key the server
        // does not have yet: it must park.
        let child = signed_assertion(
            "example",
            "ch",
            vec![Object::Ip4(std::net::Ipv4Addr::new(9, 9, 9, 9))],
            &ch_key,
        );
        let outcome = engine.process(Section::Assertion(child), source).await;
        assert!(matches!(outcome, Outcome::Parked { issue_query: true }));

        // The delegation for "ch" now arrives, signed by the root key.
        let delegation = signed_assertion("ch", ".", vec![Object::Delegation(ch_public)], &root_key);
        let outcome = engine.process(Section::Assertion(delegation), source).await;
        assert!(matches!(outcome, Outcome::Admitted { .. }));

        // The parked child assertion should now be verifiable and in cache.
        let zone: ZoneName = "ch".into();
        let found = caches.assertions.lock().await.get(
            &Context::default_context(),
            &zone,
            "example",
            crate::wire::message::ObjectType::Ip4,
        );
        assert!(found.is_some());
        assert!(caches.pending_keys.lock().await.is_empty());
    }

    #[tokio::test]
    async fn admitting_an_assertion_wakes_a_pending_query_for_it() {
        let config = test_config();
        let caches = Caches::new(&config);
        let (root_key, root_public) = ed25519_keypair();
        caches
            .zone_keys
            .write()
            .await
            .add(ZoneName::from("ch"), Context::default_context(), root_public);

        let token = Token::random();
        let waiter: SocketAddr = "127.0.0.1:2".parse().unwrap();
        caches
            .pending_queries
            .lock()
            .await
            .add(
                token,
                crate::wire::message::Query {
                    name: "www".into(),
                    context: Context::default_context(),
                    expiration: 1_000_000,
                    types: vec![crate::wire::message::ObjectType::Ip4],
                    options: vec![],
                },
                "ch".into(),
                waiter,
                0,
            )
            .unwrap();

        let engine = TrustEngine {
            caches: &caches,
            config: &config,
            metrics: &crate::metrics::Metrics::new(),
        };
        let source: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a = signed_assertion(
            "www",
            "ch",
            vec![Object::Ip4(std::net::Ipv4Addr::new(1, 1, 1, 1))],
            &root_key,
        );
        let outcome = engine.process(Section::Assertion(a), source).await;
        match outcome {
            Outcome::Admitted { wake } => assert_eq!(wake, vec![token]),
            _ => panic!("expected Admitted"),
        }
    }
}
