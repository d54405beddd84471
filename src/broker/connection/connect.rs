//! CONNECT handling and session replay

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use super::{rand_id, Connection, ConnectionError};
use crate::hooks::ConnectDecision;
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, ProtocolError, PubRel, Publish, ReturnCode,
};
use crate::session::{DeliveryState, InflightMessage, Session};

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// AwaitConnect state: the first packet must be a CONNECT
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);

                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        _ => {
                            debug!("first packet from {} was not CONNECT", self.addr);
                            Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                                "first packet must be CONNECT",
                            )))
                        }
                    };
                }
                Ok(None) => {
                    // Need more data
                }
                Err(DecodeError::UnsupportedProtocolLevel(level)) => {
                    // The one parse error that gets a reply: CONNACK code 1
                    debug!("unsupported protocol level {} from {}", level, self.addr);
                    let _ = self
                        .write_packet(&Packet::ConnAck(ConnAck::new(
                            false,
                            ReturnCode::UnacceptableProtocolVersion,
                        )))
                        .await;
                    return Err(ConnectionError::Decode(
                        DecodeError::UnsupportedProtocolLevel(level),
                    ));
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        // An empty client identifier is only legal with a clean session
        // [MQTT-3.1.3-8]; otherwise CONNACK code 2 and close
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "rejecting empty client id with clean_session=0 from {}",
                self.addr
            );
            self.write_packet(&Packet::ConnAck(ConnAck::new(
                false,
                ReturnCode::IdentifierRejected,
            )))
            .await?;
            return Err(ConnectionError::Protocol(ProtocolError::ConnectionRefused(
                ReturnCode::IdentifierRejected as u8,
            )));
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("auto-{:016x}", rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        let decision = self
            .core
            .hooks
            .on_before_connect(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;

        if decision != ConnectDecision::Allow {
            let code = match decision {
                ConnectDecision::BadCredentials => ReturnCode::BadCredentials,
                _ => ReturnCode::NotAuthorized,
            };
            debug!("CONNECT from {} refused: {:?}", client_id, code);
            self.write_packet(&Packet::ConnAck(ConnAck::new(false, code)))
                .await?;
            return Err(ConnectionError::Protocol(ProtocolError::ConnectionRefused(
                code as u8,
            )));
        }

        self.username = connect.username.clone();
        self.will = connect.will.clone();
        self.keep_alive = connect.keep_alive;

        let (session, session_present) = self.bind_session(&client_id, connect.clean_session).await?;

        // Evict any incumbent before installing this connection; its
        // connected flag is already down when we take the slot
        self.core.register_client(
            client_id.clone(),
            crate::broker::ClientHandle {
                conn_id: self.conn_id,
                sender: self.outbound_tx.clone(),
                connected: self.connected.clone(),
            },
        );

        self.client_id = Some(client_id.clone());
        self.session = Some(session.clone());

        // CONNACK goes out before any replayed PUBLISH
        self.write_packet(&Packet::ConnAck(ConnAck::new(
            session_present,
            ReturnCode::Accepted,
        )))
        .await?;

        if !self
            .core
            .hooks
            .on_connect(&client_id, self.username.as_deref())
            .await
        {
            debug!("on_connect vetoed {}", client_id);
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "connection vetoed",
            )));
        }

        if session_present {
            self.replay_session(&session).await?;
        }

        Ok(())
    }

    /// Construct or resume the session per the clean flag
    async fn bind_session(
        &mut self,
        client_id: &Arc<str>,
        clean: bool,
    ) -> Result<(Arc<RwLock<Session>>, bool), ConnectionError> {
        if clean {
            // Purge any durable copy; a clean session starts empty and
            // leaves nothing behind
            if let Err(e) = self.core.session_store.remove(client_id) {
                error!(client_id = %client_id, error = %e, "failed to purge stored session");
            }
            let session = Arc::new(RwLock::new(Session::new(client_id.clone(), true)));
            self.core.sessions.insert(session.clone());
            return Ok((session, false));
        }

        // Resume a memory-resident session from a prior connection
        if let Some(session) = self.core.sessions.get(client_id) {
            return Ok((session, true));
        }

        // Load a durable copy; an unparsable blob was already purged by
        // the store and reports as absent
        match self.core.session_store.load(client_id) {
            Ok(Some(stored)) => {
                let session = Arc::new(RwLock::new(stored.into_session()));
                self.core.sessions.insert(session.clone());
                return Ok((session, true));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "failed to load stored session");
            }
        }

        // Fresh non-clean session: it must be stored before the
        // connection is acknowledged
        let session = Arc::new(RwLock::new(Session::new(client_id.clone(), false)));
        let save_result = self.core.session_store.save(&session.read());
        if let Err(e) = save_result {
            error!(client_id = %client_id, error = %e, "failed to store new session");
            self.write_packet(&Packet::ConnAck(ConnAck::new(
                false,
                ReturnCode::ServerUnavailable,
            )))
            .await?;
            return Err(ConnectionError::Protocol(ProtocolError::ConnectionRefused(
                ReturnCode::ServerUnavailable as u8,
            )));
        }
        self.core.sessions.insert(session.clone());
        Ok((session, false))
    }

    /// Resume a non-clean session: resend every in-flight message in
    /// ascending packet-id order with DUP=1 and its QoS state machine
    /// re-armed, then re-register the stored subscriptions in the trie.
    async fn replay_session(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let client_id = self.client_id.clone().unwrap();

        let entries: Vec<(u16, crate::session::OutboundMessage)> = session
            .read()
            .outbound
            .iter()
            .map(|(id, message)| (*id, message.clone()))
            .collect();

        for (packet_id, message) in entries {
            match message.state {
                DeliveryState::Unacknowledged => {
                    let inflight = Arc::new(
                        InflightMessage::new(
                            client_id.clone(),
                            packet_id,
                            message.topic.clone(),
                            message.payload.clone(),
                            message.qos,
                            false,
                        ),
                    );
                    self.core.message_store.store(inflight.clone());
                    crate::broker::spawn_retry(self.core.clone(), inflight);

                    self.write_packet(&Packet::Publish(Publish {
                        dup: true,
                        qos: message.qos,
                        retain: false,
                        topic: message.topic,
                        packet_id: Some(packet_id),
                        payload: message.payload,
                    }))
                    .await?;
                }
                DeliveryState::PubrecReceived => {
                    // The receiver saw the PUBLISH; continue at PUBREL
                    let inflight = Arc::new(
                        InflightMessage::new(
                            client_id.clone(),
                            packet_id,
                            message.topic.clone(),
                            message.payload.clone(),
                            message.qos,
                            false,
                        )
                        .with_state(DeliveryState::PubrecReceived),
                    );
                    self.core.message_store.store(inflight.clone());
                    crate::broker::spawn_retry(self.core.clone(), inflight);

                    self.write_packet(&Packet::PubRel(PubRel { packet_id })).await?;
                }
                _ => {
                    // Completed exchanges left behind by a crash
                    let mut s = session.write();
                    s.acknowledge_outbound(packet_id, message.state, true);
                    self.core.persist(&s);
                }
            }
        }

        let subscriptions = session.read().subscriptions.clone();
        for sub in subscriptions {
            self.core
                .filter_index
                .subscribe(&sub.filter, client_id.clone(), sub.qos);
        }

        Ok(())
    }
}
