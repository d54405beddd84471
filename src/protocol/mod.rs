//! MQTT protocol definitions and types
//!
//! Defines the core MQTT v3.1.1 types shared by the codec and the broker.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;

/// Protocol level byte for MQTT v3.1.1 in the CONNECT variable header
pub const PROTOCOL_LEVEL: u8 = 4;

/// Protocol name in the CONNECT variable header
pub const PROTOCOL_NAME: &str = "MQTT";

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Effective delivery QoS: the broker never upgrades, only downgrades
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// CONNACK return codes (MQTT v3.1.1 section 3.2.2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0,
    /// Unacceptable protocol version
    UnacceptableProtocolVersion = 1,
    /// Client identifier rejected
    IdentifierRejected = 2,
    /// Server unavailable
    ServerUnavailable = 3,
    /// Bad user name or password
    BadCredentials = 4,
    /// Not authorized
    NotAuthorized = 5,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ReturnCode::Accepted),
            1 => Some(ReturnCode::UnacceptableProtocolVersion),
            2 => Some(ReturnCode::IdentifierRejected),
            3 => Some(ReturnCode::ServerUnavailable),
            4 => Some(ReturnCode::BadCredentials),
            5 => Some(ReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

/// SUBACK per-filter failure code
pub const SUBACK_FAILURE: u8 = 0x80;

/// MQTT packet type (high nibble of the fixed header first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}
