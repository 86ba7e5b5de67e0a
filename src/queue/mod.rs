//! The queue fabric: three bounded FIFOs with companion worker-slot
//! semaphores.
//!
//! `Prio` strictly preempts `Normal` for shared workers: a shared worker
//! re-checks `Prio` on every iteration via a biased `select!`, which tries
//! branches top-to-bottom rather than at random.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::state::Caches;
use crate::wire::message::{Message, Section};

/// One message pulled off the wire, awaiting trust-engine processing.
pub struct Item {
    pub message: Message,
    pub source: SocketAddr,
}

/// Which queue a message's classification routes it to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Prio,
    Normal,
    Notify,
}

/// A notification routes to `Notify`; a section signed by a zone already
/// present in the zone-key cache routes to `Prio` (it can be verified
/// without a delegation round trip); everything else is `Normal`.
pub async fn classify(message: &Message, caches: &Caches) -> Target {
    if message
        .sections
        .iter()
        .any(|s| matches!(s, Section::Notification(_)))
    {
        return Target::Notify;
    }

    let zone_keys = caches.zone_keys.read().await;
    let now = crate::util::now_secs();
    for section in &message.sections {
        let (Some(zone), Some(context)) = (section.subject_zone(), section.context()) else {
            continue;
        };
        let Some(signatures) = section.signatures() else {
            continue;
        };
        for sig in signatures {
            if zone_keys
                .lookup(zone, context, sig.key_phase, sig.algorithm, now)
                .is_some()
            {
                return Target::Prio;
            }
        }
    }
    Target::Normal
}

/// A callback invoked by a worker once it has leased a slot and dequeued
/// an item. Boxed rather than generic so `QueueFabric` can hold workers of
/// different handlers without becoming generic itself.
pub type Handler = Arc<dyn Fn(Item) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Lane {
    tx: mpsc::Sender<Item>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Item>>,
    slots: Semaphore,
}

impl Lane {
    fn new(buffer_size: usize, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Lane {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            slots: Semaphore::new(worker_count),
        }
    }
}

pub struct QueueFabric {
    prio: Lane,
    normal: Lane,
    notify: Lane,
}

/// The enqueue side was full; the item is dropped and the caller emits
/// `UnspecServerErr` to the sender.
pub struct QueueFull;

impl QueueFabric {
    pub fn new(
        prio_buffer_size: usize,
        normal_buffer_size: usize,
        notification_buffer_size: usize,
        prio_worker_count: usize,
        normal_worker_count: usize,
        notification_worker_count: usize,
    ) -> Self {
        QueueFabric {
            prio: Lane::new(prio_buffer_size, prio_worker_count),
            normal: Lane::new(normal_buffer_size, normal_worker_count),
            notify: Lane::new(notification_buffer_size, notification_worker_count),
        }
    }

    /// Non-blocking: a full queue drops the item rather than waiting.
    pub fn enqueue(&self, target: Target, item: Item) -> Result<(), QueueFull> {
        let lane = match target {
            Target::Prio => &self.prio,
            Target::Normal => &self.normal,
            Target::Notify => &self.notify,
        };
        lane.tx.try_send(item).map_err(|_| QueueFull)
    }

    pub fn depths(&self) -> (usize, usize, usize) {
        (
            self.prio.tx.max_capacity() - self.prio.tx.capacity(),
            self.normal.tx.max_capacity() - self.normal.tx.capacity(),
            self.notify.tx.max_capacity() - self.notify.tx.capacity(),
        )
    }

    /// Drains `Prio` exclusively, one worker-slot at a time.
    pub async fn run_priority_worker(self: Arc<Self>, handler: Handler) {
        loop {
            let Ok(permit) = self.prio.slots.acquire().await else {
                return;
            };
            let item = self.prio.rx.lock().await.recv().await;
            let Some(item) = item else { return };
            handler(item).await;
            drop(permit);
        }
    }

    /// Drains `Prio` first, falling through to `Normal` only when `Prio`
    /// is empty, re-checking on every iteration.
    pub async fn run_shared_worker(self: Arc<Self>, handler: Handler) {
        loop {
            let Ok(permit) = self.normal.slots.acquire().await else {
                return;
            };
            let item = {
                let mut prio_rx = self.prio.rx.lock().await;
                let mut normal_rx = self.normal.rx.lock().await;
                tokio::select! {
                    biased;
                    item = prio_rx.recv() => item,
                    item = normal_rx.recv() => item,
                }
            };
            let Some(item) = item else { return };
            handler(item).await;
            drop(permit);
        }
    }

    pub async fn run_notify_worker(self: Arc<Self>, handler: Handler) {
        loop {
            let Ok(permit) = self.notify.slots.acquire().await else {
                return;
            };
            let item = self.notify.rx.lock().await.recv().await;
            let Some(item) = item else { return };
            handler(item).await;
            drop(permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::token::Token;
    use camino::Utf8PathBuf;

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
            check_point_path: Utf8PathBuf::from("/tmp/rainsd-test"),
            pre_load_caches: false,
            reap_verify_timeout_secs: 60,
        }
    }

    #[tokio::test]
    async fn a_notification_is_classified_to_notify() {
        let caches = Caches::new(&test_config());
        let mut message = Message::new(Token::random());
        message.sections.push(Section::Notification(crate::wire::message::Notification {
            token: Token::random(),
            code: crate::wire::message::NotificationCode::Heartbeat,
            data: "".into(),
        }));
        assert_eq!(classify(&message, &caches).await, Target::Notify);
    }

    #[tokio::test]
    async fn enqueue_past_capacity_drops_the_item() {
        let fabric = QueueFabric::new(1, 1, 1, 1, 1, 1);
        let item = |token| Item {
            message: Message::new(token),
            source: "127.0.0.1:1".parse().unwrap(),
        };
        assert!(fabric.enqueue(Target::Normal, item(Token::random())).is_ok());
        assert!(fabric.enqueue(Target::Normal, item(Token::random())).is_err());
    }
}
