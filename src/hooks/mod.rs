//! Broker event hooks
//!
//! Twelve extension points invoked inline at fixed places in the packet
//! pipeline. The `before` hooks can veto their phase: a denied connect
//! closes the connection, a denied publish is dropped, a denied
//! subscribe/unsubscribe skips that filter. Hooks run in declaration
//! order and the first veto halts the phase.
//!
//! Extensions are compiled in and selected by name through the
//! `PluginRegistry`; the `plugins` config key gives the load order.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::protocol::QoS;

/// Outcome of `on_before_connect`. The rejection variants map to the
/// CONNACK return codes sent before the connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectDecision {
    /// Let the client in
    #[default]
    Allow,
    /// Reject with CONNACK code 4 (bad user name or password)
    BadCredentials,
    /// Reject with CONNACK code 5 (not authorized)
    NotAuthorized,
}

/// Broker hooks trait.
///
/// Every method has a default implementation that allows everything and
/// does nothing, so extensions implement only the hooks they care about.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called once while the broker starts, before any listener binds
    async fn bootstrap(&self) {}

    /// After accept, before any read. Veto closes the socket.
    async fn on_socket_open(&self, _addr: SocketAddr) -> bool {
        true
    }

    /// CONNECT parsed, before session initialization. A rejection closes
    /// the connection after the corresponding CONNACK.
    async fn on_before_connect(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> ConnectDecision {
        ConnectDecision::Allow
    }

    /// After a successful CONNACK. Veto closes the connection.
    async fn on_connect(&self, _client_id: &str, _username: Option<&str>) -> bool {
        true
    }

    /// After a PUBLISH is parsed, before any policy decision
    #[allow(clippy::too_many_arguments)]
    async fn on_message(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _payload: &[u8],
        _dup: bool,
        _qos: QoS,
        _retain: bool,
    ) {
    }

    /// After `on_message`, before routing. Veto drops the publish.
    #[allow(clippy::too_many_arguments)]
    async fn on_before_publish(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _payload: &[u8],
        _dup: bool,
        _qos: QoS,
        _retain: bool,
    ) -> bool {
        true
    }

    /// After the message has been routed to subscribers
    #[allow(clippy::too_many_arguments)]
    async fn on_publish(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _payload: &[u8],
        _dup: bool,
        _qos: QoS,
        _retain: bool,
    ) {
    }

    /// Per filter in a SUBSCRIBE. Veto skips the filter (SUBACK failure).
    async fn on_before_subscribe(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _filter: &str,
        _qos: QoS,
    ) -> bool {
        true
    }

    /// Per filter, after the subscription is inserted
    async fn on_subscribe(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _filter: &str,
        _qos: QoS,
    ) {
    }

    /// Per filter in an UNSUBSCRIBE. Veto skips the filter.
    async fn on_before_unsubscribe(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _filter: &str,
    ) -> bool {
        true
    }

    /// Per filter, after the subscription is removed
    async fn on_unsubscribe(&self, _client_id: &str, _username: Option<&str>, _filter: &str) {}

    /// After the connection is fully closed
    async fn on_disconnect(&self, _client_id: &str, _username: Option<&str>, _graceful: bool) {}
}

/// Default hooks: allow everything, observe nothing
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

impl Default for DefaultHooks {
    fn default() -> Self {
        Self
    }
}

/// Chains hook implementations in declaration order.
///
/// `before` hooks short-circuit on the first veto; event hooks are
/// invoked on every member.
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn bootstrap(&self) {
        for hooks in &self.hooks {
            hooks.bootstrap().await;
        }
    }

    async fn on_socket_open(&self, addr: SocketAddr) -> bool {
        for hooks in &self.hooks {
            if !hooks.on_socket_open(addr).await {
                return false;
            }
        }
        true
    }

    async fn on_before_connect(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> ConnectDecision {
        for hooks in &self.hooks {
            let decision = hooks.on_before_connect(client_id, username, password).await;
            if decision != ConnectDecision::Allow {
                return decision;
            }
        }
        ConnectDecision::Allow
    }

    async fn on_connect(&self, client_id: &str, username: Option<&str>) -> bool {
        for hooks in &self.hooks {
            if !hooks.on_connect(client_id, username).await {
                return false;
            }
        }
        true
    }

    async fn on_message(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        payload: &[u8],
        dup: bool,
        qos: QoS,
        retain: bool,
    ) {
        for hooks in &self.hooks {
            hooks
                .on_message(client_id, username, topic, payload, dup, qos, retain)
                .await;
        }
    }

    async fn on_before_publish(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        payload: &[u8],
        dup: bool,
        qos: QoS,
        retain: bool,
    ) -> bool {
        for hooks in &self.hooks {
            if !hooks
                .on_before_publish(client_id, username, topic, payload, dup, qos, retain)
                .await
            {
                return false;
            }
        }
        true
    }

    async fn on_publish(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        payload: &[u8],
        dup: bool,
        qos: QoS,
        retain: bool,
    ) {
        for hooks in &self.hooks {
            hooks
                .on_publish(client_id, username, topic, payload, dup, qos, retain)
                .await;
        }
    }

    async fn on_before_subscribe(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
        qos: QoS,
    ) -> bool {
        for hooks in &self.hooks {
            if !hooks
                .on_before_subscribe(client_id, username, filter, qos)
                .await
            {
                return false;
            }
        }
        true
    }

    async fn on_subscribe(&self, client_id: &str, username: Option<&str>, filter: &str, qos: QoS) {
        for hooks in &self.hooks {
            hooks.on_subscribe(client_id, username, filter, qos).await;
        }
    }

    async fn on_before_unsubscribe(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
    ) -> bool {
        for hooks in &self.hooks {
            if !hooks.on_before_unsubscribe(client_id, username, filter).await {
                return false;
            }
        }
        true
    }

    async fn on_unsubscribe(&self, client_id: &str, username: Option<&str>, filter: &str) {
        for hooks in &self.hooks {
            hooks.on_unsubscribe(client_id, username, filter).await;
        }
    }

    async fn on_disconnect(&self, client_id: &str, username: Option<&str>, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_disconnect(client_id, username, graceful).await;
        }
    }
}

/// Constructor for a compiled-in extension
pub type PluginConstructor = fn() -> Box<dyn Hooks>;

/// Compile-time plugin registry.
///
/// Dynamic module loading is impractical for a static binary; extensions
/// register a constructor under a name instead, and the ordered `plugins`
/// config list selects which ones run.
pub struct PluginRegistry {
    constructors: HashMap<String, PluginConstructor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, constructor: PluginConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    /// Instantiate the named extensions in order. Unknown names are
    /// returned so the caller can log them.
    pub fn build(&self, names: &[String]) -> (CompositeHooks, Vec<String>) {
        let mut composite = CompositeHooks::new();
        let mut unknown = Vec::new();

        for name in names {
            match self.constructors.get(name) {
                Some(constructor) => composite.hooks.push(constructor()),
                None => unknown.push(name.clone()),
            }
        }

        (composite, unknown)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct Deny;

    #[async_trait]
    impl Hooks for Deny {
        async fn on_before_publish(
            &self,
            _client_id: &str,
            _username: Option<&str>,
            _topic: &str,
            _payload: &[u8],
            _dup: bool,
            _qos: QoS,
            _retain: bool,
        ) -> bool {
            false
        }

        async fn on_before_connect(
            &self,
            _client_id: &str,
            _username: Option<&str>,
            _password: Option<&[u8]>,
        ) -> ConnectDecision {
            ConnectDecision::NotAuthorized
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Hooks for Counter {
        async fn on_subscribe(
            &self,
            _client_id: &str,
            _username: Option<&str>,
            _filter: &str,
            _qos: QoS,
        ) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn default_hooks_allow_everything() {
        let hooks = DefaultHooks;
        assert!(hooks.on_socket_open("127.0.0.1:1883".parse().unwrap()).await);
        assert_eq!(
            hooks.on_before_connect("c1", None, None).await,
            ConnectDecision::Allow
        );
        assert!(hooks.on_connect("c1", None).await);
    }

    #[tokio::test]
    async fn composite_halts_on_first_veto() {
        let count = Arc::new(AtomicUsize::new(0));
        let composite = CompositeHooks::new()
            .with(Counter(count.clone()))
            .with(Deny)
            .with(Counter(count.clone()));

        assert!(
            !composite
                .on_before_publish("c1", None, "a", b"x", false, QoS::AtMostOnce, false)
                .await
        );
        assert_eq!(
            composite.on_before_connect("c1", None, None).await,
            ConnectDecision::NotAuthorized
        );

        // Event hooks reach every member
        composite.on_subscribe("c1", None, "a", QoS::AtMostOnce).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn registry_builds_in_config_order() {
        fn make_deny() -> Box<dyn Hooks> {
            Box::new(Deny)
        }

        let mut registry = PluginRegistry::new();
        registry.register("deny", make_deny);

        let (composite, unknown) =
            registry.build(&["deny".to_string(), "missing".to_string()]);
        assert_eq!(composite.len(), 1);
        assert_eq!(unknown, vec!["missing".to_string()]);
    }
}
