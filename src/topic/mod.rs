//! Topic filters, retained messages and subscription matching
//!
//! The `FilterIndex` is a trie keyed by topic-level segment. Each node
//! carries the subscriptions terminating at it and an optional retained
//! message. Forward matching resolves a published topic name to its
//! subscribers; reverse matching resolves a new subscription filter to the
//! retained messages it should replay.

mod trie;
pub mod validation;

pub use validation::{valid_filter, valid_topic_name};

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;
use trie::Node;

/// A subscription entry stored in the trie.
///
/// Sessions are referenced by client identifier, never by pointer: the
/// registry resolves the identifier to a live connection, and the session
/// outlives any single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    pub qos: QoS,
}

/// A retained application message, stamped with its time of receipt so
/// replay order is stable.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub timestamp: Instant,
}

/// Thread-safe topic trie: concurrent forward matches, exclusive writers.
pub struct FilterIndex {
    root: RwLock<Node>,
}

impl FilterIndex {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::new()),
        }
    }

    /// Insert or update a subscription at the filter's terminal node.
    /// A resubscribe by the same client updates the QoS in place.
    ///
    /// The filter must already have passed `valid_filter`.
    pub fn subscribe(&self, filter: &str, client_id: Arc<str>, qos: QoS) {
        self.root.write().subscribe(filter, client_id, qos);
    }

    /// Remove the client's subscription at the filter's terminal node.
    /// Returns true iff a matching subscription existed.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        self.root.write().unsubscribe(filter, client_id)
    }

    /// Remove the client's subscriptions from every node that references it.
    /// Called on disconnect when the session state is not being retained.
    pub fn unsubscribe_all(&self, client_id: &str) {
        self.root.write().unsubscribe_all(client_id);
    }

    /// Forward match: collect every subscription whose filter matches the
    /// published topic name.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let segs: SmallVec<[&str; 8]> = topic.split('/').collect();
        let mut out = SmallVec::new();
        self.root.read().forward_match(&segs, &mut out);
        out
    }

    /// Store a retained message at its topic node, replacing any previous
    /// one. At most one retained message exists per topic.
    pub fn set_retained(&self, message: RetainedMessage) {
        self.root.write().set_retained(message);
    }

    /// Clear the retained slot at the topic node, if any.
    pub fn clear_retained(&self, topic: &str) {
        self.root.write().clear_retained(topic);
    }

    /// Reverse match: collect the retained messages stored at topics the
    /// filter matches, sorted ascending by time of receipt.
    pub fn retained_matches(&self, filter: &str) -> Vec<RetainedMessage> {
        let segs: SmallVec<[&str; 8]> = filter.split('/').collect();
        let mut out = Vec::new();
        self.root.read().reverse_match(&segs, &mut out);
        out.sort_by_key(|m| m.timestamp);
        out
    }

    /// Render the tree in indented text form, for logs and tests.
    pub fn render(&self) -> String {
        self.root.read().render()
    }
}

impl Default for FilterIndex {
    fn default() -> Self {
        Self::new()
    }
}
