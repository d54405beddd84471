//! Codec unit tests
//!
//! Byte vectors come straight from the MQTT v3.1.1 specification examples.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use std::sync::Arc;

use super::*;
use crate::protocol::{
    ConnAck, Connect, DecodeError, FilterRequest, Packet, PubRel, Publish, QoS, ReturnCode, SubAck,
    Subscribe, Will,
};

fn decode_one(bytes: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
    Decoder::new().decode(bytes)
}

fn encode_one(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_packet(packet, &mut buf).expect("encode failed");
    buf
}

#[test]
fn remaining_length_single_byte() {
    let mut buf = BytesMut::new();
    assert_eq!(write_remaining_length(&mut buf, 0).unwrap(), 1);
    assert_eq!(&buf[..], &[0x00]);

    buf.clear();
    assert_eq!(write_remaining_length(&mut buf, 127).unwrap(), 1);
    assert_eq!(&buf[..], &[0x7F]);
}

#[test]
fn remaining_length_multi_byte() {
    let mut buf = BytesMut::new();
    write_remaining_length(&mut buf, 128).unwrap();
    assert_eq!(&buf[..], &[0x80, 0x01]);

    buf.clear();
    write_remaining_length(&mut buf, 16_383).unwrap();
    assert_eq!(&buf[..], &[0xFF, 0x7F]);

    buf.clear();
    write_remaining_length(&mut buf, 2_097_152).unwrap();
    assert_eq!(&buf[..], &[0x80, 0x80, 0x80, 0x01]);

    buf.clear();
    write_remaining_length(&mut buf, 268_435_455).unwrap();
    assert_eq!(&buf[..], &[0xFF, 0xFF, 0xFF, 0x7F]);
}

#[test]
fn remaining_length_rejects_five_bytes() {
    let err = read_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).unwrap_err();
    assert_eq!(err, DecodeError::InvalidRemainingLength);
}

#[test]
fn remaining_length_rejects_too_large_value() {
    let mut buf = BytesMut::new();
    let err = write_remaining_length(&mut buf, 268_435_456).unwrap_err();
    assert_eq!(err, crate::protocol::EncodeError::PacketTooLarge);
}

proptest! {
    #[test]
    fn remaining_length_round_trip(n in 0u32..=268_435_455) {
        let mut buf = BytesMut::new();
        let written = write_remaining_length(&mut buf, n).unwrap();
        prop_assert_eq!(written, remaining_length_len(n));
        let (decoded, consumed) = read_remaining_length(&buf).unwrap();
        prop_assert_eq!(decoded, n);
        prop_assert_eq!(consumed, written);
    }
}

#[test]
fn connack_accepted_bytes() {
    let buf = encode_one(&Packet::ConnAck(ConnAck::new(false, ReturnCode::Accepted)));
    assert_eq!(&buf[..], &[0x20, 0x02, 0x00, 0x00]);
}

#[test]
fn connack_session_present_bytes() {
    let buf = encode_one(&Packet::ConnAck(ConnAck::new(true, ReturnCode::Accepted)));
    assert_eq!(&buf[..], &[0x20, 0x02, 0x01, 0x00]);
}

#[test]
fn suback_granted_qos1_bytes() {
    let buf = encode_one(&Packet::SubAck(SubAck {
        packet_id: 10,
        return_codes: vec![0x01],
    }));
    assert_eq!(&buf[..], &[0x90, 0x03, 0x00, 0x0A, 0x01]);
}

#[test]
fn publish_qos0_bytes() {
    let buf = encode_one(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: Arc::from("a/b"),
        packet_id: None,
        payload: Bytes::from_static(b"hi"),
    }));
    assert_eq!(&buf[..], &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']);
}

#[test]
fn pubrel_reserved_flag_bits() {
    let buf = encode_one(&Packet::PubRel(PubRel { packet_id: 42 }));
    assert_eq!(&buf[..], &[0x62, 0x02, 0x00, 0x2A]);

    // PUBREL without the 0010 flags is a protocol violation
    let err = decode_one(&[0x60, 0x02, 0x00, 0x2A]).unwrap_err();
    assert_eq!(err, DecodeError::InvalidFlags);

    let (packet, consumed) = decode_one(&buf).unwrap().unwrap();
    assert_eq!(consumed, 4);
    assert_eq!(packet, Packet::PubRel(PubRel { packet_id: 42 }));
}

#[test]
fn pingreq_pingresp_disconnect() {
    assert_eq!(&encode_one(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_one(&Packet::PingResp)[..], &[0xD0, 0x00]);
    assert_eq!(&encode_one(&Packet::Disconnect)[..], &[0xE0, 0x00]);

    let (packet, _) = decode_one(&[0xC0, 0x00]).unwrap().unwrap();
    assert_eq!(packet, Packet::PingReq);
}

#[test]
fn connect_round_trip_full() {
    let connect = Connect {
        client_id: "c1".to_string(),
        clean_session: false,
        keep_alive: 30,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
        will: Some(Will {
            topic: "status/c1".to_string(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
    };

    let buf = encode_one(&Packet::Connect(Box::new(connect.clone())));
    let (packet, consumed) = decode_one(&buf).unwrap().unwrap();
    assert_eq!(consumed, buf.len());
    assert_eq!(packet, Packet::Connect(Box::new(connect)));
}

#[test]
fn connect_rejects_bad_protocol_name() {
    // "MQIsdp" is the 3.1 name, not accepted at level 4 framing
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x10]);
    write_string(&mut buf, "MQIsdp").unwrap();
    buf.extend_from_slice(&[0x03, 0x02, 0x00, 0x3C]);
    write_string(&mut buf, "c1").unwrap();

    let err = decode_one(&buf).unwrap_err();
    assert_eq!(err, DecodeError::InvalidProtocolName);
}

#[test]
fn connect_rejects_unsupported_level() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x0E]);
    write_string(&mut buf, "MQTT").unwrap();
    buf.extend_from_slice(&[0x03, 0x02, 0x00, 0x3C]);
    write_string(&mut buf, "c1").unwrap();

    let err = decode_one(&buf).unwrap_err();
    assert_eq!(err, DecodeError::UnsupportedProtocolLevel(3));
}

#[test]
fn connect_rejects_reserved_flag() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x0E]);
    write_string(&mut buf, "MQTT").unwrap();
    // Reserved bit 0 set in the connect flags
    buf.extend_from_slice(&[0x04, 0x03, 0x00, 0x3C]);
    write_string(&mut buf, "c1").unwrap();

    let err = decode_one(&buf).unwrap_err();
    assert_eq!(err, DecodeError::InvalidFlags);
}

#[test]
fn connect_rejects_password_without_username() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x12]);
    write_string(&mut buf, "MQTT").unwrap();
    buf.extend_from_slice(&[0x04, 0x42, 0x00, 0x3C]);
    write_string(&mut buf, "c1").unwrap();
    write_binary(&mut buf, b"pw").unwrap();

    let err = decode_one(&buf).unwrap_err();
    assert_eq!(err, DecodeError::InvalidFlags);
}

#[test]
fn connect_rejects_truncated_payload() {
    // Client id length prefix claims 10 bytes but only 2 follow
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x10, 0x0E]);
    write_string(&mut buf, "MQTT").unwrap();
    buf.extend_from_slice(&[0x04, 0x02, 0x00, 0x3C, 0x00, 0x0A, b'c', b'1']);

    let err = decode_one(&buf).unwrap_err();
    assert_eq!(err, DecodeError::InsufficientData);
}

#[test]
fn publish_rejects_wildcard_topic() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x30, 0x05]);
    write_string(&mut buf, "a/+").unwrap();

    assert!(matches!(
        decode_one(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_rejects_dup_on_qos0() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x38, 0x05]);
    write_string(&mut buf, "a/b").unwrap();

    assert!(matches!(
        decode_one(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_rejects_zero_packet_id() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x32, 0x07]);
    write_string(&mut buf, "a/b").unwrap();
    buf.extend_from_slice(&[0x00, 0x00]);

    assert!(matches!(
        decode_one(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_qos1_round_trip() {
    let publish = Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: Arc::from("sensors/temp"),
        packet_id: Some(7),
        payload: Bytes::from_static(b"21.5"),
    };

    let buf = encode_one(&Packet::Publish(publish.clone()));
    let (packet, _) = decode_one(&buf).unwrap().unwrap();
    assert_eq!(packet, Packet::Publish(publish));
}

#[test]
fn subscribe_round_trip() {
    let subscribe = Subscribe {
        packet_id: 10,
        filters: vec![
            FilterRequest {
                filter: "a/b".to_string(),
                qos: QoS::AtLeastOnce,
            },
            FilterRequest {
                filter: "c/#".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
    };

    let buf = encode_one(&Packet::Subscribe(subscribe.clone()));
    assert_eq!(buf[0], 0x82);
    let (packet, _) = decode_one(&buf).unwrap().unwrap();
    assert_eq!(packet, Packet::Subscribe(subscribe));
}

#[test]
fn subscribe_rejects_missing_qos_byte() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x82, 0x07, 0x00, 0x0A]);
    write_string(&mut buf, "a/b").unwrap();

    let err = decode_one(&buf).unwrap_err();
    assert_eq!(err, DecodeError::InsufficientData);
}

#[test]
fn subscribe_rejects_empty_payload() {
    let err = decode_one(&[0x82, 0x02, 0x00, 0x0A]).unwrap_err();
    assert!(matches!(err, DecodeError::MalformedPacket(_)));
}

#[test]
fn subscribe_rejects_reserved_qos_bits() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x82, 0x08, 0x00, 0x0A]);
    write_string(&mut buf, "a/b").unwrap();
    buf.extend_from_slice(&[0x05]);

    assert!(matches!(decode_one(&buf), Err(DecodeError::InvalidQoS(_))));
}

#[test]
fn incomplete_packet_returns_none() {
    // Fixed header promises 7 bytes, only 3 arrived
    let partial = [0x30, 0x07, 0x00, 0x03, b'a'];
    assert_eq!(decode_one(&partial).unwrap(), None);

    // A single byte cannot even carry the length
    assert_eq!(decode_one(&[0x30]).unwrap(), None);
}

#[test]
fn two_packets_in_one_buffer() {
    let mut buf = encode_one(&Packet::PingReq);
    let second = encode_one(&Packet::Publish(Publish {
        topic: Arc::from("a"),
        payload: Bytes::from_static(b"x"),
        ..Default::default()
    }));
    buf.extend_from_slice(&second);

    let (first, consumed) = decode_one(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (next, _) = decode_one(&buf[consumed..]).unwrap().unwrap();
    assert!(matches!(next, Packet::Publish(_)));
}

#[test]
fn rejects_unknown_packet_type() {
    let err = decode_one(&[0xF0, 0x00]).unwrap_err();
    assert_eq!(err, DecodeError::InvalidPacketType(15));
}

#[test]
fn rejects_oversized_packet() {
    let decoder = Decoder::new().with_max_packet_size(16);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x30, 0x20]);
    buf.extend_from_slice(&[0u8; 32]);

    let err = decoder.decode(&buf).unwrap_err();
    assert_eq!(err, DecodeError::PacketTooLarge);
}

#[test]
fn string_rejects_null_character() {
    let mut buf = BytesMut::new();
    buf.put_u16(3);
    buf.extend_from_slice(b"a\0b");

    assert!(matches!(
        read_string(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}
