//! The pool of open TLS streams per peer endpoint.
//!
//! Entries are mutated only by the task holding the connection: a
//! connection task registers itself on accept/dial and deregisters itself
//! on close, so the cache never needs to second-guess whether a handle is
//! still live.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::wire::message::Message;

/// A monotonically increasing id distinguishing multiple simultaneous
/// streams to the same peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// A handle the switchboard uses to hand an outbound message to a
/// connection's writer task without holding the stream itself.
///
/// Also carries the flag through which a `CapHashNotKnown` reply tells this
/// connection's writer to attach the full capability list to the next
/// message instead of the usual hash stand-in.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Message>,
    resend_capabilities: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<Message>, resend_capabilities: Arc<AtomicBool>) -> Self {
        ConnectionHandle { sender, resend_capabilities }
    }

    pub fn send(&self, message: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.sender.send(message)
    }

    /// Called when this peer sends back `CapHashNotKnown`.
    pub fn request_full_capabilities(&self) {
        self.resend_capabilities.store(true, Ordering::Relaxed);
    }
}

pub struct ConnectionCache {
    by_peer: HashMap<SocketAddr, Vec<(ConnectionId, ConnectionHandle)>>,
    next_id: u64,
}

impl ConnectionCache {
    pub fn new() -> Self {
        ConnectionCache {
            by_peer: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_peer.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    /// Register a newly accepted/dialed connection, returning its id.
    pub fn add(&mut self, peer: SocketAddr, handle: ConnectionHandle) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.by_peer.entry(peer).or_default().push((id, handle));
        id
    }

    /// Deregister a closed stream. Drops the peer's entry entirely once its
    /// last stream closes.
    pub fn remove(&mut self, peer: &SocketAddr, id: ConnectionId) {
        if let Some(streams) = self.by_peer.get_mut(peer) {
            streams.retain(|(candidate, _)| *candidate != id);
            if streams.is_empty() {
                self.by_peer.remove(peer);
            }
        }
    }

    /// Any open stream to `peer`, reused to avoid dialing again.
    pub fn any(&self, peer: &SocketAddr) -> Option<&ConnectionHandle> {
        self.by_peer.get(peer)?.first().map(|(_, handle)| handle)
    }

    /// Drop every stream registered for `peer`. Used by the switchboard
    /// after a failed send, so the next attempt dials fresh rather than
    /// handing the message to a connection already known to be dead.
    pub fn remove_all(&mut self, peer: &SocketAddr) {
        self.by_peer.remove(peer);
    }
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removing_the_last_stream_drops_the_peer_entry() {
        let mut cache = ConnectionCache::new();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(tx, Arc::new(AtomicBool::new(false)));
        let id = cache.add(peer, handle);

        assert_eq!(cache.len(), 1);
        cache.remove(&peer, id);
        assert!(cache.is_empty());
    }
}
