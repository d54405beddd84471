//! Trie node structure and the matching algorithms

use std::fmt::Write as _;
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use super::{RetainedMessage, Subscription};
use crate::protocol::QoS;

/// One topic level.
///
/// The `+` and `#` children live in their own slots rather than the child
/// map, so a forward match descends into at most three candidates per
/// segment (exact, `+`, `#`) and visits each (node, remaining-segments)
/// pair once. The slots double as the wildcard-presence flags.
pub(super) struct Node {
    children: AHashMap<CompactString, Node>,
    single_wildcard: Option<Box<Node>>,
    multi_wildcard: Option<Box<Node>>,
    subscriptions: Vec<Subscription>,
    retained: Option<RetainedMessage>,
}

impl Node {
    pub(super) fn new() -> Self {
        Self {
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
            subscriptions: Vec::new(),
            retained: None,
        }
    }

    fn child_for(&mut self, segment: &str) -> &mut Node {
        match segment {
            "#" => self.multi_wildcard.get_or_insert_with(Default::default),
            "+" => self.single_wildcard.get_or_insert_with(Default::default),
            _ => self
                .children
                .entry(CompactString::new(segment))
                .or_default(),
        }
    }

    fn find_terminal(&mut self, filter: &str) -> Option<&mut Node> {
        let mut node = self;
        for segment in filter.split('/') {
            node = match segment {
                "#" => node.multi_wildcard.as_deref_mut()?,
                "+" => node.single_wildcard.as_deref_mut()?,
                _ => node.children.get_mut(segment)?,
            };
        }
        Some(node)
    }

    pub(super) fn subscribe(&mut self, filter: &str, client_id: Arc<str>, qos: QoS) {
        let mut node = self;
        for segment in filter.split('/') {
            node = node.child_for(segment);
        }
        node.create_or_update(client_id, qos);
    }

    /// Insert-or-update by client identifier: a resubscribe rebinds the
    /// QoS in place instead of appending a duplicate entry.
    fn create_or_update(&mut self, client_id: Arc<str>, qos: QoS) {
        for sub in &mut self.subscriptions {
            if sub.client_id == client_id {
                sub.qos = qos;
                return;
            }
        }
        self.subscriptions.push(Subscription { client_id, qos });
    }

    pub(super) fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let Some(node) = self.find_terminal(filter) else {
            return false;
        };
        let before = node.subscriptions.len();
        node.subscriptions.retain(|s| s.client_id.as_ref() != client_id);
        node.subscriptions.len() != before
    }

    pub(super) fn unsubscribe_all(&mut self, client_id: &str) {
        self.subscriptions.retain(|s| s.client_id.as_ref() != client_id);
        if let Some(node) = self.single_wildcard.as_deref_mut() {
            node.unsubscribe_all(client_id);
        }
        if let Some(node) = self.multi_wildcard.as_deref_mut() {
            node.unsubscribe_all(client_id);
        }
        for node in self.children.values_mut() {
            node.unsubscribe_all(client_id);
        }
    }

    /// Forward match a published topic name against the subtree.
    ///
    /// A `#` child matches the remainder of the topic including zero
    /// segments, so `a/#` receives messages published to `a` itself.
    pub(super) fn forward_match(&self, segs: &[&str], out: &mut SmallVec<[Subscription; 16]>) {
        if let Some(node) = self.multi_wildcard.as_deref() {
            out.extend(node.subscriptions.iter().cloned());
        }

        let Some((seg, rest)) = segs.split_first() else {
            out.extend(self.subscriptions.iter().cloned());
            return;
        };

        if let Some(node) = self.children.get(*seg) {
            node.forward_match(rest, out);
        }
        if let Some(node) = self.single_wildcard.as_deref() {
            node.forward_match(rest, out);
        }
    }

    pub(super) fn set_retained(&mut self, message: RetainedMessage) {
        let topic = message.topic.clone();
        let mut node = self;
        for segment in topic.split('/') {
            node = node.children.entry(CompactString::new(segment)).or_default();
        }
        node.retained = Some(message);
    }

    pub(super) fn clear_retained(&mut self, topic: &str) {
        let mut node = self;
        for segment in topic.split('/') {
            match node.children.get_mut(segment) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.retained = None;
    }

    /// Reverse match a subscription filter against stored retained
    /// messages: `+` matches any single child, `#` matches the current
    /// node and every descendant, a concrete segment matches only the
    /// identically-named child.
    pub(super) fn reverse_match(&self, segs: &[&str], out: &mut Vec<RetainedMessage>) {
        let Some((seg, rest)) = segs.split_first() else {
            if let Some(ref message) = self.retained {
                out.push(message.clone());
            }
            return;
        };

        match *seg {
            "#" => {
                if let Some(ref message) = self.retained {
                    out.push(message.clone());
                }
                for child in self.children.values() {
                    child.reverse_match(&["#"], out);
                }
            }
            "+" => {
                for child in self.children.values() {
                    child.reverse_match(rest, out);
                }
            }
            _ => {
                if let Some(child) = self.children.get(*seg) {
                    child.reverse_match(rest, out);
                }
            }
        }
    }

    pub(super) fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, "", 0);
        out
    }

    fn render_into(&self, out: &mut String, name: &str, depth: usize) {
        if depth > 0 {
            let retained = self
                .retained
                .as_ref()
                .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
                .unwrap_or_else(|| "-".to_string());
            let subs: Vec<String> = self
                .subscriptions
                .iter()
                .map(|s| format!("{}:{}", s.client_id, s.qos as u8))
                .collect();
            let _ = writeln!(
                out,
                "{}{} [{}] retained={}",
                "  ".repeat(depth - 1),
                name,
                subs.join(", "),
                retained
            );
        }
        for (segment, child) in &self.children {
            child.render_into(out, segment, depth + 1);
        }
        if let Some(child) = self.single_wildcard.as_deref() {
            child.render_into(out, "+", depth + 1);
        }
        if let Some(child) = self.multi_wildcard.as_deref() {
            child.render_into(out, "#", depth + 1);
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}
