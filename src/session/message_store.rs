//! Global in-flight message store
//!
//! Tracks every live broker-originated QoS 1/2 delivery, keyed by the
//! subscriber's client identifier and the packet identifier the broker
//! assigned. Retry timers observe an entry's delivery state through an
//! atomic word, without taking the map lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::QoS;

/// Acknowledgement progress of an in-flight QoS 1/2 message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryState {
    /// PUBLISH sent, nothing heard back
    Unacknowledged = 0,
    /// QoS 1 complete
    PubackReceived = 1,
    /// QoS 2: PUBREC received, PUBREL sent
    PubrecReceived = 2,
    /// QoS 2 inbound: PUBREL received
    PubrelReceived = 3,
    /// QoS 2 complete
    PubcompReceived = 4,
}

impl DeliveryState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DeliveryState::Unacknowledged),
            1 => Some(DeliveryState::PubackReceived),
            2 => Some(DeliveryState::PubrecReceived),
            3 => Some(DeliveryState::PubrelReceived),
            4 => Some(DeliveryState::PubcompReceived),
            _ => None,
        }
    }

    /// Terminal states end the retry loop
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::PubackReceived | DeliveryState::PubcompReceived
        )
    }
}

/// An in-flight outbound application message
#[derive(Debug)]
pub struct InflightMessage {
    pub client_id: Arc<str>,
    pub packet_id: u16,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    status: AtomicU8,
}

impl InflightMessage {
    pub fn new(
        client_id: Arc<str>,
        packet_id: u16,
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            client_id,
            packet_id,
            topic,
            payload,
            qos,
            retain,
            status: AtomicU8::new(DeliveryState::Unacknowledged as u8),
        }
    }

    pub fn with_state(self, state: DeliveryState) -> Self {
        self.status.store(state as u8, Ordering::Release);
        self
    }

    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_u8(self.status.load(Ordering::Acquire))
            .unwrap_or(DeliveryState::Unacknowledged)
    }

    pub fn set_state(&self, state: DeliveryState) {
        self.status.store(state as u8, Ordering::Release);
    }
}

/// Concurrent map of in-flight outbound messages
pub struct MessageStore {
    messages: DashMap<(Arc<str>, u16), Arc<InflightMessage>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
        }
    }

    pub fn store(&self, message: Arc<InflightMessage>) {
        self.messages
            .insert((message.client_id.clone(), message.packet_id), message);
    }

    pub fn get(&self, client_id: &Arc<str>, packet_id: u16) -> Option<Arc<InflightMessage>> {
        self.messages
            .get(&(client_id.clone(), packet_id))
            .map(|entry| entry.clone())
    }

    /// Record an acknowledgement: transition the state and optionally drop
    /// the entry. Returns the entry if it existed.
    pub fn acknowledge(
        &self,
        client_id: &Arc<str>,
        packet_id: u16,
        state: DeliveryState,
        remove: bool,
    ) -> Option<Arc<InflightMessage>> {
        let key = (client_id.clone(), packet_id);
        let message = self.messages.get(&key).map(|entry| entry.clone())?;
        message.set_state(state);
        if remove {
            self.messages.remove(&key);
        }
        Some(message)
    }

    /// Drop every entry belonging to a client. Used when a clean session
    /// disconnects so deliveries never leave stale entries behind.
    pub fn remove_client(&self, client_id: &str) {
        self.messages
            .retain(|(id, _), _| id.as_ref() != client_id);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}
