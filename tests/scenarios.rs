//! Black-box scenario tests exercising several components together, as
//! opposed to the unit tests colocated with each module.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use tokio::sync::mpsc;

use rainsd::cache::assertion::AssertionCache;
use rainsd::config::Config;
use rainsd::crypto::{self, PrivateKey};
use rainsd::error::RainsError;
use rainsd::metrics::Metrics;
use rainsd::net::{tls, Switchboard};
use rainsd::queue::{classify, Handler, Item, QueueFabric, Target};
use rainsd::server::Server;
use rainsd::state::Caches;
use rainsd::token::Token;
use rainsd::trust::{inconsistent_notification, Outcome, TrustEngine};
use rainsd::wire::canonical::encode_section_body;
use rainsd::wire::message::{
    Assertion, Context, KeySpace, Message, NotificationCode, Object, ObjectType, PublicKey,
    Section, Shard, Signature, SignatureAlgorithm, SignatureData, ZoneName,
};

fn test_config() -> Config {
    Config {
        root_zone_public_key_path: Utf8PathBuf::from("root.pem"),
        server_address: "127.0.0.1:5555".parse().unwrap(),
        keep_alive_period_secs: 60,
        tcp_timeout_secs: 30,
        tls_certificate_file: Utf8PathBuf::from("cert.pem"),
        tls_private_key_file: Utf8PathBuf::from("key.pem"),
        insecure_skip_verify: true,
        msg_max_size: 65535,
        prio_buffer_size: 16,
        normal_buffer_size: 2048,
        notification_buffer_size: 16,
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
        check_point_path: Utf8PathBuf::from("/tmp/rainsd-scenario-test"),
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
    let mut assertion = Assertion {
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
    let body = encode_section_body(&Section::Assertion(assertion.clone()));
    crypto::sign(key, &body, &mut assertion.signatures[0]).unwrap();
    assertion
}

/// Scenario 1: a root delegation for "ch" is admitted, then a query for
/// `name:"ch", type:delegation, context:"."` is answered from cache.
#[tokio::test]
async fn happy_assertion_is_admitted_and_answers_a_later_query() {
    let config = test_config();
    let caches = Caches::new(&config);
    let (root_key, root_public) = ed25519_keypair();
    caches
        .zone_keys
        .write()
        .await
        .add(ZoneName::from("."), Context::default_context(), root_public);

    let engine = TrustEngine {
        caches: &caches,
        config: &config,
        metrics: &Metrics::new(),
    };
    let source: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let (_ch_key, ch_public) = ed25519_keypair();
    let delegation = signed_assertion("ch", ".", vec![Object::Delegation(ch_public.clone())], &root_key);
    let outcome = engine.process(Section::Assertion(delegation), source).await;
    assert!(matches!(outcome, Outcome::Admitted { .. }));

    let root_zone: ZoneName = ".".into();
    let answer = caches
        .assertions
        .lock()
        .await
        .get(&Context::default_context(), &root_zone, "ch", ObjectType::Delegation)
        .cloned();
    let answer = answer.expect("a query for the delegation should now be answerable from cache");
    assert_eq!(answer.objects, vec![Object::Delegation(ch_public)]);
}

/// Scenario 2: an assertion signed by a key the server does not yet have
/// parks and requests a delegation query; once that delegation arrives, the
/// parked assertion is verified and admitted.
#[tokio::test]
async fn deferred_key_assertion_is_admitted_once_its_delegation_arrives() {
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
        metrics: &Metrics::new(),
    };
    let source: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let child = signed_assertion(
        "example",
        "ch",
        vec![Object::Ip4(std::net::Ipv4Addr::new(9, 9, 9, 9))],
        &ch_key,
    );
    let outcome = engine.process(Section::Assertion(child), source).await;
    assert!(matches!(outcome, Outcome::Parked { issue_query: true }));
    assert_eq!(caches.pending_keys.lock().await.len(), 1);

    let delegation = signed_assertion("ch", ".", vec![Object::Delegation(ch_public)], &root_key);
    let outcome = engine.process(Section::Assertion(delegation), source).await;
    assert!(matches!(outcome, Outcome::Admitted { .. }));

    let ch_zone: ZoneName = "ch".into();
    let answer = caches.assertions.lock().await.get(
        &Context::default_context(),
        &ch_zone,
        "example",
        ObjectType::Ip4,
    );
    assert!(answer.is_some(), "the parked assertion should be admitted once its key arrives");
    assert!(caches.pending_keys.lock().await.is_empty());
}

/// Scenario 3: a shard whose declared range excludes one of its own
/// assertions fails the consistency check and is rejected with
/// `RcvInconsistentMsg`, echoing the message's token, without touching any
/// cache.
#[tokio::test]
async fn an_inconsistent_shard_is_rejected_without_mutating_any_cache() {
    let config = test_config();
    let caches = Caches::new(&config);
    let engine = TrustEngine {
        caches: &caches,
        config: &config,
        metrics: &Metrics::new(),
    };
    let source: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let token = Token::random();

    let out_of_range = Assertion {
        subject_zone: "ch".into(),
        context: Context::default_context(),
        subject_name: "z".into(),
        objects: vec![Object::Ip4(std::net::Ipv4Addr::new(1, 1, 1, 1))],
        signatures: vec![],
    };
    let shard = Shard {
        subject_zone: "ch".into(),
        context: Context::default_context(),
        range_from: "b".into(),
        range_to: "d".into(),
        content: vec![out_of_range],
        signatures: vec![],
    };

    let outcome = engine.process(Section::Shard(shard), source).await;
    let detail = match outcome {
        Outcome::Inconsistent(detail) => detail,
        _ => panic!("expected an inconsistent outcome"),
    };

    let notification = inconsistent_notification(token, &detail);
    assert_eq!(notification.token, token);
    assert_eq!(notification.code, NotificationCode::RcvInconsistentMsg);

    assert!(caches.negative_assertions.lock().await.is_empty());
    assert!(caches.assertions.lock().await.is_empty());
}

/// Scenario 4: filling the assertion cache to its hard size and inserting
/// one more evicts the least-recently-used entry, leaving size == hardSize.
#[test]
fn cache_pressure_evicts_the_least_recently_used_assertion() {
    fn assertion(name: &str) -> Assertion {
        Assertion {
            subject_zone: "ch".into(),
            context: Context::default_context(),
            subject_name: name.into(),
            objects: vec![Object::Ip4(std::net::Ipv4Addr::new(1, 2, 3, 4))],
            signatures: vec![],
        }
    }

    let mut cache = AssertionCache::new(3, 3);
    let zone: ZoneName = "ch".into();
    let ctx = Context::default_context();

    cache.add(assertion("a"), None);
    cache.add(assertion("b"), None);
    cache.add(assertion("c"), None);
    assert_eq!(cache.len(), 3);

    // Touch "a" so it is no longer the least recently used entry.
    assert!(cache.get(&ctx, &zone, "a", ObjectType::Ip4).is_some());

    cache.add(assertion("d"), None);

    assert_eq!(cache.len(), 3);
    assert!(cache.get(&ctx, &zone, "b", ObjectType::Ip4).is_none());
    assert!(cache.get(&ctx, &zone, "a", ObjectType::Ip4).is_some());
    assert!(cache.get(&ctx, &zone, "c", ObjectType::Ip4).is_some());
    assert!(cache.get(&ctx, &zone, "d", ObjectType::Ip4).is_some());
}

/// Scenario 5: with 1000 `Normal` items already queued, a single `Prio`
/// item enqueued afterward is the first thing a shared worker processes.
#[tokio::test]
async fn a_priority_item_preempts_a_backlog_of_normal_items() {
    let fabric = Arc::new(QueueFabric::new(16, 2000, 16, 1, 1, 1));
    let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

    for _ in 0..1000 {
        let item = Item {
            message: Message::new(Token::random()),
            source: peer,
        };
        fabric.enqueue(Target::Normal, item).expect("normal lane has room for 1000 items");
    }

    let prio_token = Token::random();
    let prio_item = Item {
        message: Message::new(prio_token),
        source: peer,
    };
    fabric.enqueue(Target::Prio, prio_item).expect("prio lane accepts the item");

    let (tx, mut rx) = mpsc::unbounded_channel::<Token>();
    let handler: Handler = Arc::new(move |item: Item| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(item.message.token);
        })
    });

    let worker = tokio::spawn(fabric.clone().run_shared_worker(handler));

    let first_processed = rx.recv().await.expect("the worker must process at least one item");
    assert_eq!(first_processed, prio_token, "the prio item must preempt the normal backlog");

    worker.abort();
}

/// `classify` routes a notification to `Notify` and otherwise routes to
/// `Prio` only once its signing zone's key is already cached, grounding the
/// preemption scenario in the same classification the listener itself uses.
#[tokio::test]
async fn classify_routes_a_recognized_zone_to_the_priority_lane() {
    let config = test_config();
    let caches = Caches::new(&config);
    let (_, public) = ed25519_keypair();
    caches
        .zone_keys
        .write()
        .await
        .add(ZoneName::from("ch"), Context::default_context(), public);

    let (key, _) = ed25519_keypair();
    let assertion = signed_assertion("www", "ch", vec![Object::Ip4(std::net::Ipv4Addr::new(1, 1, 1, 1))], &key);
    let mut message = Message::new(Token::random());
    message.sections.push(Section::Assertion(assertion));

    assert_eq!(classify(&message, &caches).await, Target::Prio);
}

/// Scenario 6: dialing a peer whose TLS connection cannot be established
/// exhausts every retry and reports `Unreachable` only after the full
/// exponential backoff has elapsed. `retries=2, backoffMs=10` per §8 must
/// yield at least `10 + 20 = 30ms` of sleeping before giving up.
#[tokio::test(start_paused = true)]
async fn sending_to_an_unreachable_peer_fails_after_exhausting_retries() {
    tls::install_crypto_provider();
    let server = Server::new(test_config());
    let switchboard = Switchboard::new(server);

    // Bind to grab a free loopback port, then drop the listener so nothing
    // answers: connecting to it refuses immediately without a timeout.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let started = tokio::time::Instant::now();
    let result = switchboard
        .send_to(addr, Message::new(Token::random()), 2, 10)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RainsError::Unreachable)));
    assert!(
        elapsed >= Duration::from_millis(30),
        "expected at least the full 10ms+20ms backoff schedule to elapse before giving up, got {elapsed:?}"
    );
}
