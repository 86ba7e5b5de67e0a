//! Periodic cache reaping and checkpointing.
//!
//! Three independent timers, one per checkpointed cache, each expiring
//! entries and then writing the survivors to disk. A single unit runs all
//! three so the server has one lifecycle handle to manage rather than
//! three, matching how the rest of the daemon groups related timers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::net::Switchboard;
use crate::server::{Server, Terminated, UnitCommand};
use crate::util::now_secs;
use crate::wire::message::{Message, Notification, NotificationCode, Section};

pub struct ReaperUnit {
    pub server: Arc<Server>,
    pub switchboard: Arc<Switchboard>,
}

impl ReaperUnit {
    /// If `config.pre_load_caches` is set, restore each cache from its last
    /// checkpoint before the timers start. Missing checkpoint files (e.g. a
    /// first boot) are not an error.
    async fn preload(&self) {
        if !self.server.config.pre_load_caches {
            return;
        }
        let path = self.server.config.check_point_path.join("zone_keys");
        match self.server.caches.zone_keys.write().await.restore(&path) {
            Ok(()) => info!(%path, "restored zone-key cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%path, error = %e, "failed to restore zone-key cache"),
        }

        let path = self.server.config.check_point_path.join("assertions");
        match self.server.caches.assertions.lock().await.restore(&path) {
            Ok(()) => info!(%path, "restored assertion cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%path, error = %e, "failed to restore assertion cache"),
        }

        let path = self.server.config.check_point_path.join("negative_assertions");
        match self.server.caches.negative_assertions.lock().await.restore(&path) {
            Ok(()) => info!(%path, "restored negative-assertion cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%path, error = %e, "failed to restore negative-assertion cache"),
        }
    }

    pub async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<UnitCommand>) -> Result<(), Terminated> {
        self.preload().await;

        let mut zone_key_timer =
            tokio::time::interval(Duration::from_secs(self.server.config.zone_key_checkpoint_interval_secs));
        let mut assertion_timer =
            tokio::time::interval(Duration::from_secs(self.server.config.assertion_checkpoint_interval_secs));
        let mut negative_timer = tokio::time::interval(Duration::from_secs(
            self.server.config.negative_assertion_checkpoint_interval_secs,
        ));
        let mut pending_timer = tokio::time::interval(Duration::from_secs(
            self.server.config.reap_verify_timeout_secs.max(1) as u64,
        ));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(UnitCommand::Terminate) | None => return Err(Terminated),
                    }
                }
                _ = zone_key_timer.tick() => self.reap_zone_keys().await,
                _ = assertion_timer.tick() => self.reap_assertions().await,
                _ = negative_timer.tick() => self.reap_negative_assertions().await,
                _ = pending_timer.tick() => self.reap_pending().await,
            }
        }
    }

    async fn reap_zone_keys(&self) {
        let now = now_secs();
        let mut cache = self.server.caches.zone_keys.write().await;
        let reaped = cache.remove_expired(now);
        if reaped > 0 {
            info!(reaped, "reaped expired zone keys");
        }
        self.server.metrics.zone_key_cache_size.set(cache.len() as i64);
        let path = self.server.config.check_point_path.join("zone_keys");
        if let Err(e) = cache.checkpoint(&path) {
            warn!(%path, error = %e, "failed to checkpoint zone-key cache");
        }
    }

    async fn reap_assertions(&self) {
        let now = now_secs();
        let mut cache = self.server.caches.assertions.lock().await;
        let reaped = cache.remove_expired(now);
        if reaped > 0 {
            info!(reaped, "reaped expired assertions");
        }
        self.server.metrics.assertion_cache_size.set(cache.len() as i64);
        let path = self.server.config.check_point_path.join("assertions");
        if let Err(e) = cache.checkpoint(&path) {
            warn!(%path, error = %e, "failed to checkpoint assertion cache");
        }
    }

    async fn reap_negative_assertions(&self) {
        let now = now_secs();
        let mut cache = self.server.caches.negative_assertions.lock().await;
        let reaped = cache.remove_expired(now);
        if reaped > 0 {
            info!(reaped, "reaped expired negative assertions");
        }
        self.server
            .metrics
            .negative_assertion_cache_size
            .set(cache.len() as i64);
        let path = self.server.config.check_point_path.join("negative_assertions");
        if let Err(e) = cache.checkpoint(&path) {
            warn!(%path, error = %e, "failed to checkpoint negative-assertion cache");
        }
    }

    /// Drop pending-key and pending-query entries older than
    /// `reap_verify_timeout_secs`, notifying every blocked sender with
    /// `NoAssertionAvail`.
    async fn reap_pending(&self) {
        let now = now_secs();
        let max_age = self.server.config.reap_verify_timeout_secs;

        let timed_out_keys = self.server.caches.pending_keys.lock().await.remove_expired(now, max_age);
        for (_, parked) in timed_out_keys {
            for entry in parked {
                // A parked section carries no message token of its own (a
                // token correlates a whole message, and the section that
                // needed a key may have arrived alongside others that
                // didn't); NIL signals "uncorrelated" rather than implying
                // a match the sender can look up.
                let notification = Notification {
                    token: crate::token::Token::NIL,
                    code: NotificationCode::NoAssertionAvail,
                    data: "delegation key did not arrive in time".into(),
                };
                self.notify(entry.source, notification).await;
            }
        }

        let timed_out_queries = self
            .server
            .caches
            .pending_queries
            .lock()
            .await
            .remove_expired(now, max_age);
        let mut total = 0;
        for (token, _query, _zone, waiters) in timed_out_queries {
            total += waiters.len();
            for waiter in waiters {
                let notification = Notification {
                    token,
                    code: NotificationCode::NoAssertionAvail,
                    data: "no answer arrived in time".into(),
                };
                self.notify(waiter, notification).await;
            }
        }
        if total > 0 {
            info!(total, "reaped timed-out pending queries");
        }
    }

    async fn notify(&self, peer: std::net::SocketAddr, notification: Notification) {
        let token = notification.token;
        let mut message = Message::new(token);
        message.sections.push(Section::Notification(notification));
        if let Err(e) = self
            .switchboard
            .send_to(
                peer,
                message,
                crate::net::DEFAULT_SEND_RETRIES,
                crate::net::DEFAULT_SEND_BACKOFF_MS,
            )
            .await
        {
            warn!(%peer, error = %e, "failed to deliver pending-cache timeout notification");
        }
    }
}
