//! Broker core
//!
//! The broker owns the process-wide state: the client registry, the topic
//! trie, the global in-flight message store, the live session map and the
//! durable session store. Listener accept loops hand each connection to
//! its own task; routing walks the trie and forwards through the
//! per-connection outbound channels, which serialize all socket writes
//! for a connection onto its task.

mod connection;
mod tls;

pub use connection::Connection;
pub use tls::{load_tls_acceptor, TlsError};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{bind_addr, Config};
use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::SessionStore;
use crate::protocol::{Packet, Publish, QoS};
use crate::session::{
    DeliveryState, InflightMessage, MessageStore, OutboundMessage, Session, SessionRegistry,
};
use crate::topic::{FilterIndex, RetainedMessage};
use crate::transport::{WsAcceptOptions, WsStream};

/// Grace period before the first retry-state check of an in-flight message
pub(crate) const RETRY_GRACE: Duration = Duration::from_secs(5);
/// Delay between retransmissions of an unacknowledged message
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_secs(15);
/// Per-connection outbound channel depth
pub(crate) const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address; empty disables the plain listener
    pub listen: String,
    /// TLS bind address; enabled together with cert and key
    pub tls_listen: String,
    pub tls_cert: String,
    pub tls_key: String,
    /// WebSocket bind address; empty disables
    pub ws_listen: String,
    pub ws_path: String,
    pub ws_reject_empty_origin: bool,
    pub ws_origins: Vec<String>,
    /// Secure WebSocket bind address; enabled together with cert and key
    pub wss_listen: String,
    pub wss_cert: String,
    pub wss_key: String,
    /// Session store directory
    pub storage_path: PathBuf,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: ":1883".to_string(),
            tls_listen: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            ws_listen: String::new(),
            ws_path: "/ws".to_string(),
            ws_reject_empty_origin: false,
            ws_origins: Vec::new(),
            wss_listen: String::new(),
            wss_cert: String::new(),
            wss_key: String::new(),
            storage_path: PathBuf::from(".sessions.store"),
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        let tls_enabled = config.tls.enabled();
        let wss_enabled = config.websockets.wss.enabled();
        Self {
            listen: config.listen.clone(),
            tls_listen: if tls_enabled {
                config.tls.listen.clone()
            } else {
                String::new()
            },
            tls_cert: config.tls.cert.clone(),
            tls_key: config.tls.key.clone(),
            ws_listen: config.websockets.listen.clone(),
            ws_path: config.websockets.path.clone(),
            ws_reject_empty_origin: config.websockets.reject_empty_origin,
            ws_origins: config.websockets.origins.clone(),
            wss_listen: if wss_enabled {
                config.websockets.wss.listen.clone()
            } else {
                String::new()
            },
            wss_cert: config.websockets.wss.cert.clone(),
            wss_key: config.websockets.wss.key.clone(),
            storage_path: PathBuf::from(&config.storage.path),
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Errors that abort broker startup
#[derive(Debug)]
pub enum BrokerError {
    /// Listener bind or accept setup failure
    Io(std::io::Error),
    /// Session store could not be opened
    Store(crate::persistence::StoreError),
    /// TLS material could not be loaded
    Tls(TlsError),
    /// Configuration enables no listener at all
    NoListeners,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::Store(e) => write!(f, "session store error: {}", e),
            BrokerError::Tls(e) => write!(f, "TLS error: {}", e),
            BrokerError::NoListeners => write!(f, "no listener configured"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<crate::persistence::StoreError> for BrokerError {
    fn from(e: crate::persistence::StoreError) -> Self {
        BrokerError::Store(e)
    }
}

impl From<TlsError> for BrokerError {
    fn from(e: TlsError) -> Self {
        BrokerError::Tls(e)
    }
}

/// Commands delivered to a connection's task through its outbound channel.
/// Processing them on the owning task keeps all socket writes for one
/// connection serialized.
pub(crate) enum Outbound {
    /// A routed application message. The receiving task assigns a packet
    /// id from its session for QoS > 0 and arms the retry timer.
    Publish(Publish),
    /// Retransmit an in-flight PUBLISH with its original id and DUP=1
    Resend(Arc<InflightMessage>),
    /// A control packet built elsewhere (retry PUBREL/PUBCOMP)
    Control(Packet),
    /// The client identifier reconnected; this connection must go away
    Takeover,
}

/// Registry entry for a connected client
pub(crate) struct ClientHandle {
    /// Distinguishes this connection from a successor with the same
    /// client identifier
    pub(crate) conn_id: u64,
    pub(crate) sender: mpsc::Sender<Outbound>,
    pub(crate) connected: Arc<AtomicBool>,
}

/// Shared broker state injected into every connection actor
pub(crate) struct BrokerCore {
    pub(crate) clients: DashMap<Arc<str>, ClientHandle>,
    pub(crate) filter_index: FilterIndex,
    pub(crate) message_store: MessageStore,
    pub(crate) sessions: SessionRegistry,
    pub(crate) session_store: SessionStore,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) max_packet_size: usize,
}

impl BrokerCore {
    /// Register a connection, evicting any incumbent with the same client
    /// identifier. The incumbent is cancelled synchronously: its connected
    /// flag drops before the new entry is installed.
    pub(crate) fn register_client(&self, client_id: Arc<str>, handle: ClientHandle) {
        if let Some(existing) = self.clients.get(&client_id) {
            info!(client_id = %client_id, "disconnecting existing client");
            existing.connected.store(false, Ordering::Release);
            let _ = existing.sender.try_send(Outbound::Takeover);
        }
        self.clients.insert(client_id, handle);
    }

    /// Remove the registry entry, but only if it still belongs to this
    /// connection; after a takeover the entry is the successor's.
    pub(crate) fn unregister_client(&self, client_id: &str, conn_id: u64) {
        self.clients
            .remove_if(client_id, |_, handle| handle.conn_id == conn_id);
    }

    /// Route an application message: store or clear the retained copy,
    /// forward-match the trie, and deliver to every matching subscription
    /// at min(publish QoS, subscription QoS).
    pub(crate) fn publish(&self, publish: &Publish) {
        if !crate::topic::valid_topic_name(&publish.topic) {
            return;
        }

        if publish.retain {
            if publish.payload.is_empty() {
                self.filter_index.clear_retained(&publish.topic);
            } else {
                self.filter_index.set_retained(RetainedMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    timestamp: Instant::now(),
                });
            }
        }

        for sub in self.filter_index.matches(&publish.topic) {
            let qos = publish.qos.min(sub.qos);
            // Runtime deliveries always go out with DUP=0 and retain=0;
            // the retain flag is per-receiver policy, set only on replay
            // of stored retained messages to a new subscriber.
            self.deliver(
                &sub.client_id,
                Publish {
                    dup: false,
                    qos,
                    retain: false,
                    topic: publish.topic.clone(),
                    packet_id: None,
                    payload: publish.payload.clone(),
                },
            );
        }
    }

    /// Hand a message to a subscriber: through the outbound channel when
    /// the client is connected, into the session store when it is offline
    /// with a non-clean session (QoS > 0 only).
    pub(crate) fn deliver(&self, client_id: &Arc<str>, publish: Publish) {
        if let Some(handle) = self.clients.get(client_id) {
            if handle.sender.try_send(Outbound::Publish(publish)).is_err() {
                warn!(client_id = %client_id, "outbound channel full, dropping message");
            }
            return;
        }

        if publish.qos == QoS::AtMostOnce {
            return;
        }

        if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            if !s.clean {
                let packet_id = s.next_packet_id();
                s.store_outbound(
                    packet_id,
                    OutboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: publish.qos,
                        state: DeliveryState::Unacknowledged,
                    },
                );
                self.persist(&s);
            }
        }
    }

    /// Insert-or-update a subscription in the trie and the session, flush
    /// the session, and return the retained messages to replay, sorted by
    /// receipt time.
    pub(crate) fn subscribe(
        &self,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        qos: QoS,
    ) -> Vec<RetainedMessage> {
        let client_id = {
            let mut s = session.write();
            s.upsert_subscription(filter, qos);
            self.persist(&s);
            s.client_id.clone()
        };
        self.filter_index.subscribe(filter, client_id, qos);
        self.filter_index.retained_matches(filter)
    }

    /// Remove a subscription from the trie and the session.
    /// Returns true iff a matching subscription existed.
    pub(crate) fn unsubscribe(&self, session: &Arc<RwLock<Session>>, filter: &str) -> bool {
        let client_id = {
            let mut s = session.write();
            s.remove_subscription(filter);
            self.persist(&s);
            s.client_id.clone()
        };
        self.filter_index.unsubscribe(filter, &client_id)
    }

    /// Disconnect-time cleanup of trie state. A non-clean session that
    /// went away ungracefully keeps its entries so new messages queue for
    /// its next connection; everything else is removed.
    pub(crate) fn unsubscribe_all(&self, client_id: &str, clean: bool, graceful: bool) {
        if clean || graceful {
            self.filter_index.unsubscribe_all(client_id);
        }
    }

    /// Write a non-clean session to the durable store. Failures are
    /// logged and surfaced to the caller's log context only; other
    /// clients are unaffected.
    pub(crate) fn persist(&self, session: &Session) {
        if session.clean {
            return;
        }
        if let Err(e) = self.session_store.save(session) {
            error!(client_id = %session.client_id, error = %e, "failed to persist session");
        }
    }
}

/// Timed retransmission of one in-flight QoS 1/2 message.
///
/// The task holds the message, not the connection: each tick it consults
/// the registry and exits once the subscriber is gone (the message stays
/// queued in a non-clean session) or the exchange reached a terminal
/// state.
pub(crate) fn spawn_retry(core: Arc<BrokerCore>, message: Arc<InflightMessage>) {
    tokio::spawn(async move {
        tokio::time::sleep(RETRY_GRACE).await;
        if message.state().is_terminal() {
            return;
        }
        match core.clients.get(&message.client_id) {
            Some(handle) if handle.connected.load(Ordering::Acquire) => {}
            _ => return,
        }

        loop {
            tokio::time::sleep(RETRY_INTERVAL).await;

            let Some(handle) = core.clients.get(&message.client_id) else {
                return;
            };
            if !handle.connected.load(Ordering::Acquire) {
                return;
            }

            let command = match message.state() {
                DeliveryState::Unacknowledged => Outbound::Resend(message.clone()),
                DeliveryState::PubrecReceived => Outbound::Control(Packet::PubRel(
                    crate::protocol::PubRel {
                        packet_id: message.packet_id,
                    },
                )),
                DeliveryState::PubrelReceived => Outbound::Control(Packet::PubComp(
                    crate::protocol::PubComp {
                        packet_id: message.packet_id,
                    },
                )),
                _ => return,
            };

            if handle.sender.try_send(command).is_err() {
                return;
            }
        }
    });
}

/// The MQTT broker
pub struct Broker {
    config: BrokerConfig,
    core: Arc<BrokerCore>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Create a broker with default hooks (allow everything)
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a broker with custom hooks. Opens the session store;
    /// failure here is fatal to startup.
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Result<Self, BrokerError> {
        let session_store = SessionStore::open(&config.storage_path)?;
        let (shutdown, _) = broadcast::channel(1);

        let core = Arc::new(BrokerCore {
            clients: DashMap::new(),
            filter_index: FilterIndex::new(),
            message_store: MessageStore::new(),
            sessions: SessionRegistry::new(),
            session_store,
            hooks,
            max_packet_size: config.max_packet_size,
        });

        Ok(Self {
            config,
            core,
            shutdown,
        })
    }

    /// Bind every configured listener and serve until shutdown.
    /// Fails when no listener is configured or any bind fails.
    pub async fn run(&self) -> Result<(), BrokerError> {
        self.core.hooks.bootstrap().await;

        let mut bound = 0;

        if !self.config.listen.is_empty() {
            let listener = TcpListener::bind(bind_addr(&self.config.listen)).await?;
            info!("MQTT/TCP listening on {}", listener.local_addr()?);
            self.spawn_tcp_accept_loop(listener);
            bound += 1;
        }

        if !self.config.tls_listen.is_empty() {
            let acceptor = load_tls_acceptor(&self.config.tls_cert, &self.config.tls_key)?;
            let listener = TcpListener::bind(bind_addr(&self.config.tls_listen)).await?;
            info!("MQTT/TLS listening on {}", listener.local_addr()?);
            self.spawn_tls_accept_loop(listener, acceptor);
            bound += 1;
        }

        if !self.config.ws_listen.is_empty() {
            let listener = TcpListener::bind(bind_addr(&self.config.ws_listen)).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                listener.local_addr()?,
                self.config.ws_path
            );
            self.spawn_ws_accept_loop(listener, None);
            bound += 1;
        }

        if !self.config.wss_listen.is_empty() {
            let acceptor = load_tls_acceptor(&self.config.wss_cert, &self.config.wss_key)?;
            let listener = TcpListener::bind(bind_addr(&self.config.wss_listen)).await?;
            info!(
                "MQTT/Secure WebSocket listening on {} (path: {})",
                listener.local_addr()?,
                self.config.ws_path
            );
            self.spawn_ws_accept_loop(listener, Some(acceptor));
            bound += 1;
        }

        if bound == 0 {
            return Err(BrokerError::NoListeners);
        }

        // Park until shutdown; the accept loops carry the work
        let mut shutdown_rx = self.shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        Ok(())
    }

    /// Signal every accept loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// True when a connection for the client identifier is registered
    pub fn has_client(&self, client_id: &str) -> bool {
        self.core.clients.contains_key(client_id)
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.core.clients.len()
    }

    /// Number of memory-resident sessions
    pub fn session_count(&self) -> usize {
        self.core.sessions.len()
    }

    /// Publish a broker-originated message (testing and extensions)
    pub fn publish(&self, publish: &Publish) {
        self.core.publish(publish);
    }

    fn spawn_tcp_accept_loop(&self, listener: TcpListener) {
        let core = self.core.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("accepted connection from {}", addr);
                                let core = core.clone();
                                tokio::spawn(async move {
                                    if !core.hooks.on_socket_open(addr).await {
                                        debug!("connection from {} vetoed", addr);
                                        return;
                                    }
                                    let conn = Connection::new(stream, addr, core);
                                    if let Err(e) = conn.run().await {
                                        debug!("connection from {} closed: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => error!("failed to accept connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_tls_accept_loop(&self, listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor) {
        let core = self.core.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let core = core.clone();
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    if !core.hooks.on_socket_open(addr).await {
                                        debug!("connection from {} vetoed", addr);
                                        return;
                                    }
                                    match acceptor.accept(stream).await {
                                        Ok(stream) => {
                                            let conn = Connection::new(stream, addr, core);
                                            if let Err(e) = conn.run().await {
                                                debug!("TLS connection from {} closed: {}", addr, e);
                                            }
                                        }
                                        Err(e) => debug!("TLS handshake failed for {}: {}", addr, e),
                                    }
                                });
                            }
                            Err(e) => error!("failed to accept TLS connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_ws_accept_loop(
        &self,
        listener: TcpListener,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
    ) {
        let core = self.core.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let options = WsAcceptOptions {
            path: self.config.ws_path.clone(),
            reject_empty_origin: self.config.ws_reject_empty_origin,
            origins: self.config.ws_origins.clone(),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let core = core.clone();
                                let acceptor = acceptor.clone();
                                let options = options.clone();
                                tokio::spawn(async move {
                                    if !core.hooks.on_socket_open(addr).await {
                                        debug!("connection from {} vetoed", addr);
                                        return;
                                    }
                                    match acceptor {
                                        Some(acceptor) => match acceptor.accept(stream).await {
                                            Ok(stream) => {
                                                match WsStream::accept(stream, &options).await {
                                                    Ok(ws) => {
                                                        let conn = Connection::new(ws, addr, core);
                                                        if let Err(e) = conn.run().await {
                                                            debug!("WSS connection from {} closed: {}", addr, e);
                                                        }
                                                    }
                                                    Err(e) => debug!("WebSocket handshake failed for {}: {}", addr, e),
                                                }
                                            }
                                            Err(e) => debug!("TLS handshake failed for {}: {}", addr, e),
                                        },
                                        None => match WsStream::accept(stream, &options).await {
                                            Ok(ws) => {
                                                let conn = Connection::new(ws, addr, core);
                                                if let Err(e) = conn.run().await {
                                                    debug!("WS connection from {} closed: {}", addr, e);
                                                }
                                            }
                                            Err(e) => debug!("WebSocket handshake failed for {}: {}", addr, e),
                                        },
                                    }
                                });
                            }
                            Err(e) => error!("failed to accept WebSocket connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}
