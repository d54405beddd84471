//! Serializable session models
//!
//! Storage-friendly mirrors of the runtime session types, encoded with
//! bincode into one blob per client identifier.

use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::QoS;
use crate::session::{DeliveryState, InboundMessage, OutboundMessage, Session};

/// Stored session blob
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub subscriptions: Vec<StoredSubscription>,
    pub outbound: Vec<StoredOutbound>,
    pub inbound: Vec<StoredInbound>,
}

/// Stored subscription
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
}

/// Stored outbound QoS 1/2 message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredOutbound {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub state: u8,
}

/// Stored inbound QoS 2 message awaiting PUBREL
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredInbound {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub state: u8,
}

impl StoredSession {
    pub fn from_session(session: &Session) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            subscriptions: session
                .subscriptions
                .iter()
                .map(|sub| StoredSubscription {
                    filter: sub.filter.clone(),
                    qos: sub.qos as u8,
                })
                .collect(),
            outbound: session
                .outbound
                .iter()
                .map(|(packet_id, message)| StoredOutbound {
                    packet_id: *packet_id,
                    topic: message.topic.to_string(),
                    payload: message.payload.to_vec(),
                    qos: message.qos as u8,
                    state: message.state as u8,
                })
                .collect(),
            inbound: session
                .inbound
                .iter()
                .map(|(packet_id, message)| StoredInbound {
                    packet_id: *packet_id,
                    topic: message.topic.to_string(),
                    payload: message.payload.to_vec(),
                    state: message.state as u8,
                })
                .collect(),
        }
    }

    /// Rebuild a runtime session. Stored sessions are by definition
    /// non-clean.
    pub fn into_session(self) -> Session {
        let mut session = Session::new(Arc::from(self.client_id.as_str()), false);

        for sub in self.subscriptions {
            let qos = QoS::from_u8(sub.qos).unwrap_or_default();
            session.upsert_subscription(&sub.filter, qos);
        }

        for stored in self.outbound {
            session.store_outbound(
                stored.packet_id,
                OutboundMessage {
                    topic: Arc::from(stored.topic.as_str()),
                    payload: Bytes::from(stored.payload),
                    qos: QoS::from_u8(stored.qos).unwrap_or_default(),
                    state: DeliveryState::from_u8(stored.state)
                        .unwrap_or(DeliveryState::Unacknowledged),
                },
            );
        }

        for stored in self.inbound {
            session.store_inbound(
                stored.packet_id,
                InboundMessage {
                    topic: Arc::from(stored.topic.as_str()),
                    payload: Bytes::from(stored.payload),
                    state: DeliveryState::from_u8(stored.state)
                        .unwrap_or(DeliveryState::PubrecReceived),
                },
            );
        }

        session.resume_packet_ids();
        session
    }
}
