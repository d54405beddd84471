//! EmberMQ - MQTT v3.1.1 compliant message broker
//!
//! A standalone broker: plain TCP, TLS and WebSocket listeners, QoS 0/1/2
//! delivery with timed retransmission, retained messages, durable
//! non-clean sessions, and synchronous event hooks for policy extensions.

pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerConfig, BrokerError};
pub use config::Config;
pub use hooks::{CompositeHooks, ConnectDecision, DefaultHooks, Hooks, PluginRegistry};
pub use persistence::SessionStore;
pub use protocol::{Packet, QoS, ReturnCode};
pub use topic::FilterIndex;
