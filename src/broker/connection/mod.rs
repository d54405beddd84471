//! MQTT connection actor
//!
//! One actor per accepted connection, generic over the transport stream.
//! The lifecycle is a three-state machine: AwaitConnect (only CONNECT is
//! legal), Active (the full packet set), Closing (terminal). Protocol
//! violations, transport errors and parser errors all transition to
//! Closing; none of them crash the process.
//!
//! The actor's task performs every socket write for its connection: the
//! read loop answers inbound packets directly, and peer publishes, retry
//! timers and takeover commands arrive through the outbound channel and
//! are written here, so packet bytes never interleave.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{BrokerCore, Outbound, OUTBOUND_CHANNEL_CAPACITY};
use crate::codec::{encode_packet, Decoder};
use crate::protocol::{
    DecodeError, Packet, ProtocolError, PubAck, Publish, QoS, Will,
};
use crate::session::{DeliveryState, InflightMessage, OutboundMessage, Session};

/// How long a fresh connection may sit silent before its CONNECT arrives
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    /// Keep-alive or CONNECT deadline expired
    Timeout,
    /// The connection was cancelled by a takeover
    Evicted,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectionError::Timeout => write!(f, "connection timeout"),
            ConnectionError::Evicted => write!(f, "connection taken over"),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<crate::protocol::EncodeError> for ConnectionError {
    fn from(e: crate::protocol::EncodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

/// Whether the read loop keeps going after a packet
pub(crate) enum Flow {
    Continue,
    /// Graceful DISCONNECT received
    Closing,
}

/// Per-connection actor, generic over the transport
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) core: Arc<BrokerCore>,
    pub(crate) decoder: Decoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    /// Distinguishes this connection from a successor under the same
    /// client identifier
    pub(crate) conn_id: u64,
    pub(crate) connected: Arc<AtomicBool>,
    pub(crate) outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
    /// Set once CONNECT succeeds; None means AwaitConnect
    pub(crate) client_id: Option<Arc<str>>,
    pub(crate) session: Option<Arc<RwLock<Session>>>,
    pub(crate) username: Option<String>,
    pub(crate) will: Option<Will>,
    pub(crate) keep_alive: u16,
    /// True only when the client sent DISCONNECT
    pub(crate) graceful: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, core: Arc<BrokerCore>) -> Self {
        let max_packet_size = core.max_packet_size;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        Self {
            stream,
            addr,
            core,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            conn_id: rand_id(),
            connected: Arc::new(AtomicBool::new(true)),
            outbound_tx,
            outbound_rx,
            client_id: None,
            session: None,
            username: None,
            will: None,
            keep_alive: 0,
            graceful: false,
        }
    }

    /// Drive the connection to completion. Whatever way it ends, the
    /// disconnect bookkeeping (registry, will, session, hooks) runs
    /// exactly once here.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;

        if self.client_id.is_some() {
            self.finalize_disconnect().await;
        }

        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        match timeout(CONNECT_TIMEOUT, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("CONNECT timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        }

        self.run_active().await
    }

    /// Main loop for the Active state
    async fn run_active(&mut self) -> Result<(), ConnectionError> {
        let client_id = self
            .client_id
            .clone()
            .expect("active connection has a client id");

        // Close after 1.5x the advertised keep-alive with no packet;
        // keep-alive 0 disables the idle timeout
        let idle = if self.keep_alive > 0 {
            Duration::from_millis(self.keep_alive as u64 * 1500)
        } else {
            Duration::from_secs(86400 * 365)
        };
        let mut deadline = tokio::time::Instant::now() + idle;

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("connection closed by {}", client_id);
                            return Ok(());
                        }
                        Ok(_) => {
                            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                                self.read_buf.advance(consumed);
                                deadline = tokio::time::Instant::now() + idle;
                                match self.handle_packet(packet).await? {
                                    Flow::Continue => {}
                                    Flow::Closing => return Ok(()),
                                }
                            }
                        }
                        Err(e) => {
                            debug!("read error from {}: {}", client_id, e);
                            return Err(e.into());
                        }
                    }
                }

                command = self.outbound_rx.recv() => {
                    match command {
                        Some(command) => self.handle_outbound(command).await?,
                        None => return Ok(()),
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    info!("keep-alive timeout for {}", client_id);
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }

    /// Dispatch one inbound packet in the Active state
    async fn handle_packet(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Protocol(
                ProtocolError::ProtocolViolation("duplicate CONNECT"),
            )),
            Packet::Publish(publish) => {
                self.handle_publish(publish).await?;
                Ok(Flow::Continue)
            }
            Packet::PubAck(ack) => {
                self.handle_puback(ack).await;
                Ok(Flow::Continue)
            }
            Packet::PubRec(rec) => {
                self.handle_pubrec(rec).await?;
                Ok(Flow::Continue)
            }
            Packet::PubRel(rel) => {
                self.handle_pubrel(rel).await?;
                Ok(Flow::Continue)
            }
            Packet::PubComp(comp) => {
                self.handle_pubcomp(comp).await;
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(subscribe).await?;
                Ok(Flow::Continue)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(unsubscribe).await?;
                Ok(Flow::Continue)
            }
            Packet::PingReq => {
                self.write_packet(&Packet::PingResp).await?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => {
                // Graceful close: the will is discarded, never published
                self.graceful = true;
                self.will = None;
                Ok(Flow::Closing)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "server-to-client packet received",
                )))
            }
        }
    }

    /// Execute a command from the outbound channel
    async fn handle_outbound(&mut self, command: Outbound) -> Result<(), ConnectionError> {
        match command {
            Outbound::Publish(publish) => self.send_publish(publish).await,
            Outbound::Resend(message) => {
                let publish = Publish {
                    dup: true,
                    qos: message.qos,
                    retain: message.retain,
                    topic: message.topic.clone(),
                    packet_id: Some(message.packet_id),
                    payload: message.payload.clone(),
                };
                self.write_packet(&Packet::Publish(publish)).await
            }
            Outbound::Control(packet) => self.write_packet(&packet).await,
            Outbound::Takeover => Err(ConnectionError::Evicted),
        }
    }

    /// Emit an application message to this client. QoS > 0 messages get a
    /// packet id from the session, are recorded in the session store and
    /// the global in-flight store, and arm a retry timer.
    pub(crate) async fn send_publish(&mut self, mut publish: Publish) -> Result<(), ConnectionError> {
        if publish.qos == QoS::AtMostOnce {
            return self.write_packet(&Packet::Publish(publish)).await;
        }

        let session = self
            .session
            .clone()
            .expect("active connection has a session");
        let client_id = self.client_id.clone().unwrap();

        let packet_id = {
            let mut s = session.write();
            let packet_id = s.next_packet_id();
            s.store_outbound(
                packet_id,
                OutboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    state: DeliveryState::Unacknowledged,
                },
            );
            self.core.persist(&s);
            packet_id
        };

        let inflight = Arc::new(InflightMessage::new(
            client_id,
            packet_id,
            publish.topic.clone(),
            publish.payload.clone(),
            publish.qos,
            publish.retain,
        ));
        self.core.message_store.store(inflight.clone());
        super::spawn_retry(self.core.clone(), inflight);

        publish.packet_id = Some(packet_id);
        self.write_packet(&Packet::Publish(publish)).await
    }

    /// Acknowledge an inbound QoS 1 publish
    pub(crate) async fn send_puback(&mut self, packet_id: u16) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::PubAck(PubAck { packet_id })).await
    }

    /// Encode and write one packet to the transport
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        encode_packet(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}

/// Generate a random identifier without pulling in an RNG dependency
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
