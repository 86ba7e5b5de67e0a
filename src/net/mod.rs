//! The TLS listener and switchboard.
//!
//! A listener accepts inbound TLS connections; a switchboard dials and
//! reuses outbound ones. Both sides hand a stream off to the same
//! reader/writer task pair once the handshake completes, so a connection
//! looks the same to the rest of the server regardless of which side
//! opened it.

pub mod tls;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::cache::connection::{ConnectionHandle, ConnectionId};
use crate::error::RainsError;
use crate::queue::{classify, Item};
use crate::server::Server;
use crate::token::Token;
use crate::wire::codec::{CodecError, MessageCodec};
use crate::wire::message::{Capability, Message, Notification, NotificationCode};

/// Default `retries` for [`Switchboard::send_to`] when a caller has no
/// scenario-specific override, matching the daemon's general outbound
/// retry posture.
pub const DEFAULT_SEND_RETRIES: u32 = 4;
/// Default starting `backoffMs` for [`Switchboard::send_to`].
pub const DEFAULT_SEND_BACKOFF_MS: u64 = 200;

/// Accepts inbound TLS connections on `server.config.server_address` and
/// feeds each one into the shared connection machinery.
pub struct ListenerUnit {
    pub server: Arc<Server>,
}

/// Why the listener unit's run loop ended before a clean shutdown.
#[derive(Debug)]
pub enum StartupError {
    /// The TLS certificate or private key could not be loaded.
    Certificate,
    /// The configured listen address could not be bound.
    Bind,
    /// Shutdown was requested, or the run loop ended normally.
    Terminated,
}

impl ListenerUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<crate::server::UnitCommand>,
    ) -> Result<(), StartupError> {
        let tls_config = tls::server_config(
            &self.server.config.tls_certificate_file,
            &self.server.config.tls_private_key_file,
        )
        .map_err(|e| {
            warn!(error = %e, "failed to load TLS certificate/key");
            StartupError::Certificate
        })?;
        let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);

        let listener = TcpListener::bind(self.server.config.server_address)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to bind listener");
                StartupError::Bind
            })?;
        info!(addr = %self.server.config.server_address, "listening");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(crate::server::UnitCommand::Terminate) | None => return Err(StartupError::Terminated),
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if (self.server.is_blocked)(peer.ip()) {
                        debug!(%peer, "rejecting blocked peer");
                        continue;
                    }
                    let acceptor = acceptor.clone();
                    let server = self.server.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                spawn_connection(server, peer, tls_stream).await;
                            }
                            Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                        }
                    });
                }
            }
        }
    }
}

/// Split a freshly established stream (either side of the handshake) into
/// reader/writer tasks and register it in the connection cache.
async fn spawn_connection<S>(server: Arc<Server>, peer: SocketAddr, stream: S) -> ConnectionId
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let resend_capabilities = Arc::new(AtomicBool::new(false));
    let handle = ConnectionHandle::new(tx, resend_capabilities.clone());
    let id = server.caches.connections.lock().await.add(peer, handle);

    let write_server = server.clone();
    tokio::spawn(async move {
        write_loop(write_server, write_half, rx, resend_capabilities).await;
    });

    let read_server = server.clone();
    tokio::spawn(async move {
        read_loop(read_server.clone(), peer, read_half).await;
        read_server.caches.connections.lock().await.remove(&peer, id);
    });

    id
}

/// Writes every message handed to this connection, stamping the server's
/// capability advertisement onto outgoing messages per spec: the first
/// message on a fresh connection carries the hash stand-in, and a later
/// `CapHashNotKnown` reply (signalled through `resend_capabilities`) makes
/// the next message carry the full list instead.
async fn write_loop<W>(
    server: Arc<Server>,
    mut write_half: W,
    mut rx: mpsc::UnboundedReceiver<Message>,
    resend_capabilities: Arc<AtomicBool>,
)
where
    W: AsyncWrite + Unpin,
{
    let mut codec = MessageCodec::new(server.config.msg_max_size);
    let mut advertised = false;
    while let Some(mut message) = rx.recv().await {
        if !server.config.capabilities.is_empty() && message.capabilities.is_empty() {
            if resend_capabilities.swap(false, Ordering::Relaxed) {
                message.capabilities = server.config.capabilities.clone();
            } else if !advertised {
                let hash = crate::cache::capabilities::hash_capabilities(&server.config.capabilities);
                message.capabilities = vec![hash_capability(hash)];
            }
        }
        advertised = true;

        let mut buf = BytesMut::new();
        if let Err(e) = codec.encode(&message, &mut buf) {
            warn!(error = %e, "failed to encode outgoing message, dropping");
            continue;
        }
        if let Err(e) = write_half.write_all(&buf).await {
            warn!(error = %e, "write failed, closing connection");
            return;
        }
    }
}

async fn read_loop<R>(server: Arc<Server>, peer: SocketAddr, mut read_half: R)
where
    R: AsyncRead + Unpin,
{
    let mut codec = MessageCodec::new(server.config.msg_max_size);
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 8192];

    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(message)) => dispatch_inbound(&server, peer, message).await,
                Ok(None) => break,
                Err(e) => {
                    debug!(%peer, error = %e, "malformed frame, closing connection");
                    let code = match e {
                        CodecError::MsgTooLarge { .. } => NotificationCode::MsgTooLarge,
                        CodecError::Malformed(_) | CodecError::Io(_) => NotificationCode::BadMessage,
                    };
                    notify_peer(&server, peer, Token::NIL, code, e.to_string()).await;
                    return;
                }
            }
        }
        match read_half.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(%peer, error = %e, "read failed, closing connection");
                return;
            }
        }
    }
}

/// Route one decoded message: remember the peer's advertised capabilities
/// (resolving or rejecting a hash stand-in as needed), then classify and
/// enqueue it for trust-engine processing.
async fn dispatch_inbound(server: &Arc<Server>, peer: SocketAddr, message: Message) {
    match message.capabilities.as_slice() {
        [single] if single.as_hash_stub().is_some() => {
            let hash = single.as_hash_stub().unwrap();
            let known = server.caches.capabilities.lock().await.for_hash(&hash).is_some();
            if !known {
                reply_cap_hash_not_known(server, peer, message.token).await;
            }
        }
        [] => {}
        caps => {
            server.caches.capabilities.lock().await.add(peer, caps.to_vec());
        }
    }

    let target = classify(&message, &server.caches).await;
    let token = message.token;
    let item = Item { message, source: peer };
    if server.queues.enqueue(target, item).is_err() {
        server.metrics.send_retries_exhausted.inc();
        warn!(%peer, "queue full, dropping inbound message");
        notify_peer(
            server,
            peer,
            token,
            NotificationCode::UnspecServerErr,
            "queue full, message dropped",
        )
        .await;
    }
}

/// Send a standalone `Notification` to `peer` over whatever connection is
/// currently open to it, best-effort: if no connection is registered (or
/// the writer task is already gone), the notification is simply dropped.
async fn notify_peer(
    server: &Arc<Server>,
    peer: SocketAddr,
    token: Token,
    code: NotificationCode,
    data: impl Into<Box<str>>,
) {
    let handle = server.caches.connections.lock().await.any(&peer).cloned();
    let Some(handle) = handle else { return };
    let mut message = Message::new(token);
    message
        .sections
        .push(crate::wire::message::Section::Notification(Notification {
            token,
            code,
            data: data.into(),
        }));
    if handle.send(message).is_err() {
        warn!(%peer, "failed to deliver notification");
    }
}

/// Tell `peer` we don't recognize the capability hash it just sent, so it
/// resends its full list on the next message.
async fn reply_cap_hash_not_known(server: &Arc<Server>, peer: SocketAddr, token: crate::token::Token) {
    let handle = server.caches.connections.lock().await.any(&peer).cloned();
    let Some(handle) = handle else { return };
    let mut reply = Message::new(token);
    reply.sections.push(crate::wire::message::Section::Notification(capability_hash_notification(token)));
    if handle.send(reply).is_err() {
        warn!(%peer, "failed to send CapHashNotKnown reply");
    }
}

/// Dials and reuses outbound connections, and hands a message to whichever
/// connection reaches `peer`.
pub struct Switchboard {
    server: Arc<Server>,
    connector: tokio_rustls::TlsConnector,
}

impl Switchboard {
    pub fn new(server: Arc<Server>) -> Self {
        let connector =
            tokio_rustls::TlsConnector::from(tls::client_config(server.config.insecure_skip_verify));
        Switchboard { server, connector }
    }

    /// Send `message` to `peer`, dialing a fresh connection if none is
    /// open, retrying up to `retries` times with exponential backoff
    /// starting at `backoff_ms` and doubling each attempt, per §4.6's
    /// `sendTo(peer, msg, retries, backoffMs)`.
    pub async fn send_to(
        &self,
        peer: SocketAddr,
        message: Message,
        retries: u32,
        backoff_ms: u64,
    ) -> Result<(), RainsError> {
        let mut backoff = Duration::from_millis(backoff_ms);
        for attempt in 0..=retries {
            match self.try_send(peer, &message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(%peer, attempt, error = %e, "sendTo attempt failed");
                    self.server.caches.connections.lock().await.remove_all(&peer);
                    if attempt == retries {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        self.server.metrics.send_retries_exhausted.inc();
        Err(RainsError::Unreachable)
    }

    async fn try_send(&self, peer: SocketAddr, message: &Message) -> io::Result<()> {
        let handle = {
            let connections = self.server.caches.connections.lock().await;
            connections.any(&peer).cloned()
        };
        let handle = match handle {
            Some(handle) => handle,
            None => self.dial(peer).await?,
        };
        handle
            .send(message.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection writer task is gone"))
    }

    async fn dial(&self, peer: SocketAddr) -> io::Result<ConnectionHandle> {
        let tcp = tokio::net::TcpStream::connect(peer).await?;
        let server_name = tokio_rustls::rustls::pki_types::ServerName::IpAddress(peer.ip().into());
        let tls_stream = self.connector.connect(server_name, tcp).await?;
        spawn_connection(self.server.clone(), peer, tls_stream).await;
        let connections = self.server.caches.connections.lock().await;
        connections
            .any(&peer)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "connection vanished right after dialing"))
    }
}

/// The capability a server sends in place of its full list once a peer has
/// already seen it, as part of the `CapHashNotKnown` exchange.
pub fn hash_capability(hash: [u8; 32]) -> Capability {
    let mut text = String::with_capacity(2 + hash.len() * 2);
    text.push_str("h:");
    for byte in hash {
        text.push_str(&format!("{byte:02x}"));
    }
    Capability(text.into())
}

pub fn capability_hash_notification(token: crate::token::Token) -> Notification {
    Notification {
        token,
        code: NotificationCode::CapHashNotKnown,
        data: "".into(),
    }
}
