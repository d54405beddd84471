//! Per-client session state
//!
//! A session belongs to a client identifier, not to a connection: it is
//! created at CONNECT, survives reconnects when the clean flag is unset,
//! and is the unit of durable persistence. The live-session registry maps
//! identifiers to sessions; connections are resolved separately through
//! the broker's client registry.

mod message_store;

pub use message_store::{DeliveryState, InflightMessage, MessageStore};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::QoS;

/// A subscription as remembered by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSubscription {
    pub filter: String,
    pub qos: QoS,
}

/// A QoS 1/2 message owned by the session: either awaiting
/// acknowledgement on a live connection or queued for the next one
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub state: DeliveryState,
}

/// An inbound QoS 2 publish held between PUBREC and PUBREL so a DUP
/// retransmission is acknowledged without being routed twice
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub state: DeliveryState,
}

/// Per-client protocol state
pub struct Session {
    pub client_id: Arc<str>,
    /// Clean-session flag from CONNECT; unset sessions are persisted
    pub clean: bool,
    /// Ordered subscription list, unique by filter
    pub subscriptions: Vec<SessionSubscription>,
    /// Outbound QoS 1/2 messages keyed by packet id. A BTreeMap so replay
    /// walks ids in ascending order.
    pub outbound: BTreeMap<u16, OutboundMessage>,
    /// Inbound QoS 2 messages awaiting PUBREL
    pub inbound: HashMap<u16, InboundMessage>,
    next_packet_id: u16,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean: bool) -> Self {
        Self {
            client_id,
            clean,
            subscriptions: Vec::new(),
            outbound: BTreeMap::new(),
            inbound: HashMap::new(),
            next_packet_id: 1,
        }
    }

    /// Allocate the next free outbound packet identifier.
    /// Wraps within the 16-bit space, never yields 0 or an id still in
    /// flight.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            if !self.outbound.contains_key(&id) {
                return id;
            }
        }
    }

    /// Seed the packet-id counter past the ids restored from storage
    pub fn resume_packet_ids(&mut self) {
        if let Some(max) = self.outbound.keys().next_back() {
            self.next_packet_id = max.wrapping_add(1).max(1);
        }
    }

    /// Add or update a subscription. A resubscribe replaces the QoS in
    /// place; the list stays unique by filter bytes.
    pub fn upsert_subscription(&mut self, filter: &str, qos: QoS) {
        for sub in &mut self.subscriptions {
            if sub.filter == filter {
                sub.qos = qos;
                return;
            }
        }
        self.subscriptions.push(SessionSubscription {
            filter: filter.to_string(),
            qos,
        });
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.filter != filter);
        self.subscriptions.len() != before
    }

    pub fn store_outbound(&mut self, packet_id: u16, message: OutboundMessage) {
        self.outbound.insert(packet_id, message);
    }

    /// Transition an outbound message's state, removing it when the
    /// exchange is complete
    pub fn acknowledge_outbound(&mut self, packet_id: u16, state: DeliveryState, remove: bool) {
        if remove {
            self.outbound.remove(&packet_id);
        } else if let Some(message) = self.outbound.get_mut(&packet_id) {
            message.state = state;
        }
    }

    pub fn store_inbound(&mut self, packet_id: u16, message: InboundMessage) {
        self.inbound.insert(packet_id, message);
    }

    pub fn has_inbound(&self, packet_id: u16) -> bool {
        self.inbound.contains_key(&packet_id)
    }

    pub fn remove_inbound(&mut self, packet_id: u16) -> Option<InboundMessage> {
        self.inbound.remove(&packet_id)
    }
}

/// Live sessions resident in memory: every connected client plus
/// disconnected non-clean sessions awaiting their next connection
pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|entry| entry.clone())
    }

    pub fn insert(&self, session: Arc<RwLock<Session>>) {
        let client_id = session.read().client_id.clone();
        self.sessions.insert(client_id, session);
    }

    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Remove the entry only if it still holds this exact session; after
    /// a reconnect the identifier may map to a successor's session.
    pub fn remove_if_same(&self, client_id: &str, session: &Arc<RwLock<Session>>) {
        self.sessions
            .remove_if(client_id, |_, existing| Arc::ptr_eq(existing, session));
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
