//! Broker integration tests
//!
//! Each test drives a live broker over TCP with a minimal MQTT client,
//! asserting wire bytes and broker state against the v3.1.1 protocol.

use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use embermq::broker::{Broker, BrokerConfig};
use embermq::codec::{encode_packet, Decoder};
use embermq::protocol::{
    ConnAck, Connect, FilterRequest, Packet, PubComp, PubRec, PubRel, Publish, QoS, ReturnCode,
    Subscribe, Unsubscribe, Will,
};

// Monotonic port allocation so tests never collide
static PORT_COUNTER: AtomicU16 = AtomicU16::new(18830);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

async fn start_broker(port: u16, storage: &Path) -> Arc<Broker> {
    let config = BrokerConfig {
        listen: format!("127.0.0.1:{}", port),
        storage_path: storage.to_path_buf(),
        ..Default::default()
    };

    let broker = Arc::new(Broker::new(config).expect("failed to create broker"));
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    // Wait for the listener to come up
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return broker;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("broker did not start on port {}", port);
}

/// Minimal MQTT client for driving the broker in tests
struct TestClient {
    stream: TcpStream,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("failed to connect");
        Self {
            stream,
            decoder: Decoder::new(),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut out = BytesMut::new();
        encode_packet(packet, &mut out).expect("encode failed");
        self.stream.write_all(&out).await.expect("write failed");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }

    /// Receive one packet, buffering partial reads
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.buf) {
                let _ = self.buf.split_to(consumed);
                return Some(packet);
            }

            let mut chunk = [0u8; 4096];
            match timeout(Duration::from_secs(5), self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return None,
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                _ => return None,
            }
        }
    }

    /// Receive exactly `n` raw bytes for byte-level assertions
    async fn recv_raw(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            let mut chunk = [0u8; 4096];
            match timeout(Duration::from_secs(5), self.stream.read(&mut chunk)).await {
                Ok(Ok(len)) if len > 0 => self.buf.extend_from_slice(&chunk[..len]),
                _ => panic!("expected {} bytes, got {}", n, self.buf.len()),
            }
        }
        self.buf.split_to(n).to_vec()
    }

    /// True once the broker closed the connection
    async fn closed(&mut self) -> bool {
        loop {
            let mut chunk = [0u8; 4096];
            match timeout(Duration::from_secs(5), self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return true,
                Ok(Ok(n)) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    continue;
                }
                _ => return false,
            }
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_with_will(client_id, clean_session, None).await
    }

    async fn mqtt_connect_with_will(
        &mut self,
        client_id: &str,
        clean_session: bool,
        will: Option<Will>,
    ) -> ConnAck {
        self.send(&Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive: 60,
            username: None,
            password: None,
            will,
        })))
        .await;

        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> Vec<u8> {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![FilterRequest {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => {
                assert_eq!(ack.packet_id, packet_id);
                ack.return_codes
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(1),
        };
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;

        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => match self.recv().await {
                Some(Packet::PubAck(_)) => {}
                other => panic!("expected PUBACK, got {:?}", other),
            },
            QoS::ExactlyOnce => {
                match self.recv().await {
                    Some(Packet::PubRec(_)) => {}
                    other => panic!("expected PUBREC, got {:?}", other),
                }
                self.send(&Packet::PubRel(PubRel { packet_id: 1 })).await;
                match self.recv().await {
                    Some(Packet::PubComp(_)) => {}
                    other => panic!("expected PUBCOMP, got {:?}", other),
                }
            }
        }
    }
}

#[tokio::test]
async fn connect_returns_accepted_connack_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.send(&Packet::Connect(Box::new(Connect {
        client_id: "c1".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    })))
    .await;

    // CONNACK: session_present=0, return code 0
    assert_eq!(c1.recv_raw(4).await, vec![0x20, 0x02, 0x00, 0x00]);

    sleep(Duration::from_millis(50)).await;
    assert!(broker.has_client("c1"));
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn subscribe_returns_granted_qos_suback_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.mqtt_connect("c1", true).await;

    c1.send(&Packet::Subscribe(Subscribe {
        packet_id: 10,
        filters: vec![FilterRequest {
            filter: "a/b".to_string(),
            qos: QoS::AtLeastOnce,
        }],
    }))
    .await;

    assert_eq!(c1.recv_raw(5).await, vec![0x90, 0x03, 0x00, 0x0A, 0x01]);
}

#[tokio::test]
async fn qos0_publish_routes_exact_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.mqtt_connect("c1", true).await;
    c1.subscribe(10, "a/b", QoS::AtLeastOnce).await;

    let mut c2 = TestClient::connect(port).await;
    c2.mqtt_connect("c2", true).await;
    c2.publish("a/b", b"hi", QoS::AtMostOnce, false).await;

    // min(publish 0, subscription 1) = QoS 0, no packet id
    assert_eq!(
        c1.recv_raw(9).await,
        vec![0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
    );
}

#[tokio::test]
async fn qos_downgrades_to_subscription_level() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.mqtt_connect("c1", true).await;
    c1.subscribe(1, "t", QoS::AtMostOnce).await;

    let mut c2 = TestClient::connect(port).await;
    c2.mqtt_connect("c2", true).await;
    c2.publish("t", b"x", QoS::AtLeastOnce, false).await;

    match c1.recv().await {
        Some(Packet::Publish(publish)) => {
            assert_eq!(publish.qos, QoS::AtMostOnce);
            assert_eq!(publish.packet_id, None);
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn retained_message_replay_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c2 = TestClient::connect(port).await;
    c2.mqtt_connect("c2", true).await;
    c2.publish("x", b"keep", QoS::AtMostOnce, true).await;
    sleep(Duration::from_millis(50)).await;

    // New subscriber receives the retained copy with the retain bit set
    let mut c3 = TestClient::connect(port).await;
    c3.mqtt_connect("c3", true).await;
    c3.subscribe(1, "x", QoS::AtMostOnce).await;

    match c3.recv().await {
        Some(Packet::Publish(publish)) => {
            assert!(publish.retain);
            assert_eq!(publish.topic.as_ref(), "x");
            assert_eq!(&publish.payload[..], b"keep");
        }
        other => panic!("expected retained PUBLISH, got {:?}", other),
    }

    // Retain with an empty payload clears the slot
    c2.publish("x", b"", QoS::AtMostOnce, true).await;
    sleep(Duration::from_millis(50)).await;

    let mut c4 = TestClient::connect(port).await;
    c4.mqtt_connect("c4", true).await;
    c4.subscribe(1, "x", QoS::AtMostOnce).await;

    // Nothing to replay: the next packet is a PINGRESP, not a PUBLISH
    c4.send(&Packet::PingReq).await;
    match c4.recv().await {
        Some(Packet::PingResp) => {}
        other => panic!("expected PINGRESP only, got {:?}", other),
    }
}

#[tokio::test]
async fn retained_replay_ordered_by_receipt() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut publisher = TestClient::connect(port).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish("r/first", b"1", QoS::AtMostOnce, true).await;
    sleep(Duration::from_millis(20)).await;
    publisher.publish("r/second", b"2", QoS::AtMostOnce, true).await;
    sleep(Duration::from_millis(20)).await;
    publisher.publish("r/third", b"3", QoS::AtMostOnce, true).await;
    sleep(Duration::from_millis(50)).await;

    let mut sub = TestClient::connect(port).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "r/+", QoS::AtMostOnce).await;

    let mut topics = Vec::new();
    for _ in 0..3 {
        match sub.recv().await {
            Some(Packet::Publish(publish)) => topics.push(publish.topic.to_string()),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
    assert_eq!(topics, vec!["r/first", "r/second", "r/third"]);
}

#[tokio::test]
async fn qos2_exactly_once_flow() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c2 = TestClient::connect(port).await;
    c2.mqtt_connect("c2", true).await;
    c2.subscribe(1, "q2/t", QoS::ExactlyOnce).await;

    let mut c1 = TestClient::connect(port).await;
    c1.mqtt_connect("c1", true).await;

    // Publisher-side: PUBLISH id 42 -> PUBREC 42
    c1.send(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: Arc::from("q2/t"),
        packet_id: Some(42),
        payload: Bytes::from_static(b"once"),
    }))
    .await;
    assert_eq!(c1.recv_raw(4).await, vec![0x50, 0x02, 0x00, 0x2A]);

    // Subscriber receives exactly one PUBLISH and completes the cycle
    let sub_packet_id = match c2.recv().await {
        Some(Packet::Publish(publish)) => {
            assert_eq!(publish.qos, QoS::ExactlyOnce);
            assert_eq!(&publish.payload[..], b"once");
            publish.packet_id.unwrap()
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    };
    c2.send(&Packet::PubRec(PubRec {
        packet_id: sub_packet_id,
    }))
    .await;
    match c2.recv().await {
        Some(Packet::PubRel(rel)) => assert_eq!(rel.packet_id, sub_packet_id),
        other => panic!("expected PUBREL, got {:?}", other),
    }
    c2.send(&Packet::PubComp(PubComp {
        packet_id: sub_packet_id,
    }))
    .await;

    // A DUP retransmission of the same id is acknowledged but not
    // delivered a second time
    c1.send(&Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: Arc::from("q2/t"),
        packet_id: Some(42),
        payload: Bytes::from_static(b"once"),
    }))
    .await;
    assert_eq!(c1.recv_raw(4).await, vec![0x50, 0x02, 0x00, 0x2A]);

    // Release: PUBREL 42 (flags 0010) -> PUBCOMP 42
    c1.send_raw(&[0x62, 0x02, 0x00, 0x2A]).await;
    assert_eq!(c1.recv_raw(4).await, vec![0x70, 0x02, 0x00, 0x2A]);

    // No duplicate at the subscriber: a ping answers before anything else
    c2.send(&Packet::PingReq).await;
    match c2.recv().await {
        Some(Packet::PingResp) => {}
        other => panic!("expected PINGRESP only, got {:?}", other),
    }
}

#[tokio::test]
async fn session_survives_broker_restart() {
    let dir = tempfile::tempdir().unwrap();
    let port1 = next_port();
    let broker1 = start_broker(port1, dir.path()).await;

    // Non-clean session with one subscription
    let mut c1 = TestClient::connect(port1).await;
    let ack = c1.mqtt_connect("c1", false).await;
    assert!(!ack.session_present);
    c1.subscribe(1, "a/b", QoS::AtLeastOnce).await;

    // c1 drops without DISCONNECT; the message queues into the stored
    // session
    drop(c1);
    sleep(Duration::from_millis(100)).await;

    let mut c2 = TestClient::connect(port1).await;
    c2.mqtt_connect("c2", true).await;
    c2.publish("a/b", b"while-away", QoS::AtLeastOnce, false).await;
    sleep(Duration::from_millis(100)).await;

    // Simulated crash: stop the broker and start a fresh one on the same
    // store
    c2.send(&Packet::Disconnect).await;
    drop(c2);
    broker1.shutdown();
    sleep(Duration::from_millis(300)).await;
    drop(broker1);
    sleep(Duration::from_millis(300)).await;

    let port2 = next_port();
    let _broker2 = start_broker(port2, dir.path()).await;

    let mut c1 = TestClient::connect(port2).await;
    c1.send(&Packet::Connect(Box::new(Connect {
        client_id: "c1".to_string(),
        clean_session: false,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    })))
    .await;

    // CONNACK: session_present=1, return code 0
    assert_eq!(c1.recv_raw(4).await, vec![0x20, 0x02, 0x01, 0x00]);

    // The queued message replays with DUP=1 and its original packet id
    match c1.recv().await {
        Some(Packet::Publish(publish)) => {
            assert!(publish.dup);
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            assert_eq!(publish.packet_id, Some(1));
            assert_eq!(publish.topic.as_ref(), "a/b");
            assert_eq!(&publish.payload[..], b"while-away");
        }
        other => panic!("expected replayed PUBLISH, got {:?}", other),
    }

    // Subscriptions were restored too
    let mut c3 = TestClient::connect(port2).await;
    c3.mqtt_connect("c3", true).await;
    c3.publish("a/b", b"fresh", QoS::AtMostOnce, false).await;

    loop {
        match c1.recv().await {
            Some(Packet::Publish(publish)) if &publish.payload[..] == b"fresh" => break,
            Some(_) => continue,
            None => panic!("restored subscription did not deliver"),
        }
    }
}

#[tokio::test]
async fn incumbent_is_evicted_on_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let broker = start_broker(port, dir.path()).await;

    let mut first = TestClient::connect(port).await;
    first.mqtt_connect("dup", true).await;

    let mut second = TestClient::connect(port).await;
    second.mqtt_connect("dup", true).await;

    // The prior connection is closed by the broker
    assert!(first.closed().await);

    sleep(Duration::from_millis(50)).await;
    assert!(broker.has_client("dup"));
    assert_eq!(broker.connection_count(), 1);

    // The successor is fully functional
    second.subscribe(1, "t", QoS::AtMostOnce).await;
}

#[tokio::test]
async fn invalid_filter_gets_failure_code() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.mqtt_connect("c1", true).await;

    let codes = c1.subscribe(7, "a/#/b", QoS::AtLeastOnce).await;
    assert_eq!(codes, vec![0x80]);

    // A mixed request fails only the bad filter
    c1.send(&Packet::Subscribe(Subscribe {
        packet_id: 8,
        filters: vec![
            FilterRequest {
                filter: "ok/+".to_string(),
                qos: QoS::AtMostOnce,
            },
            FilterRequest {
                filter: "bad+".to_string(),
                qos: QoS::AtMostOnce,
            },
        ],
    }))
    .await;
    match c1.recv().await {
        Some(Packet::SubAck(ack)) => assert_eq!(ack.return_codes, vec![0x00, 0x80]),
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn wildcard_in_topic_name_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.mqtt_connect("c1", true).await;

    // PUBLISH to "a/+": 0x30, remaining 5, topic only
    c1.send_raw(&[0x30, 0x05, 0x00, 0x03, b'a', b'/', b'+']).await;
    assert!(c1.closed().await);
}

#[tokio::test]
async fn non_connect_first_packet_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.send(&Packet::PingReq).await;
    assert!(c1.closed().await);
}

#[tokio::test]
async fn unsupported_protocol_level_gets_connack_code_1() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    // CONNECT with protocol level 3
    c1.send_raw(&[
        0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x02,
        b'c', b'1',
    ])
    .await;

    assert_eq!(c1.recv_raw(4).await, vec![0x20, 0x02, 0x00, 0x01]);
    assert!(c1.closed().await);
}

#[tokio::test]
async fn empty_client_id_with_persistent_session_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.send(&Packet::Connect(Box::new(Connect {
        client_id: String::new(),
        clean_session: false,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    })))
    .await;

    // CONNACK code 2 (identifier rejected), then close
    assert_eq!(c1.recv_raw(4).await, vec![0x20, 0x02, 0x00, 0x02]);
    assert!(c1.closed().await);
}

#[tokio::test]
async fn empty_client_id_with_clean_session_gets_generated_id() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    let ack = c1.mqtt_connect("", true).await;
    assert_eq!(ack.return_code, ReturnCode::Accepted);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn will_published_on_ungraceful_disconnect_only() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut watcher = TestClient::connect(port).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "status/+", QoS::AtMostOnce).await;

    // Graceful goodbye: no will
    let mut polite = TestClient::connect(port).await;
    polite
        .mqtt_connect_with_will(
            "polite",
            true,
            Some(Will {
                topic: "status/polite".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
        )
        .await;
    polite.send(&Packet::Disconnect).await;
    drop(polite);

    // Abrupt drop: will delivered
    let mut abrupt = TestClient::connect(port).await;
    abrupt
        .mqtt_connect_with_will(
            "abrupt",
            true,
            Some(Will {
                topic: "status/abrupt".to_string(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
        )
        .await;
    drop(abrupt);

    match watcher.recv().await {
        Some(Packet::Publish(publish)) => {
            assert_eq!(publish.topic.as_ref(), "status/abrupt");
            assert_eq!(&publish.payload[..], b"gone");
        }
        other => panic!("expected will PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut c1 = TestClient::connect(port).await;
    c1.mqtt_connect("c1", true).await;
    c1.subscribe(1, "u/t", QoS::AtMostOnce).await;

    c1.send(&Packet::Unsubscribe(Unsubscribe {
        packet_id: 2,
        filters: vec!["u/t".to_string()],
    }))
    .await;
    assert_eq!(c1.recv_raw(4).await, vec![0xB0, 0x02, 0x00, 0x02]);

    let mut c2 = TestClient::connect(port).await;
    c2.mqtt_connect("c2", true).await;
    c2.publish("u/t", b"x", QoS::AtMostOnce, false).await;

    // Nothing arrives; a ping answers first
    c1.send(&Packet::PingReq).await;
    match c1.recv().await {
        Some(Packet::PingResp) => {}
        other => panic!("expected PINGRESP only, got {:?}", other),
    }
}

#[tokio::test]
async fn qos1_inbound_gets_puback_and_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _broker = start_broker(port, dir.path()).await;

    let mut sub = TestClient::connect(port).await;
    sub.mqtt_connect("sub", true).await;
    sub.subscribe(1, "q1/t", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(port).await;
    publisher.mqtt_connect("pub", true).await;
    publisher
        .send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Arc::from("q1/t"),
            packet_id: Some(11),
            payload: Bytes::from_static(b"data"),
        }))
        .await;

    // PUBACK 11 for the publisher
    assert_eq!(publisher.recv_raw(4).await, vec![0x40, 0x02, 0x00, 0x0B]);

    // Delivery at QoS 1 with a broker-assigned packet id; acknowledge it
    match sub.recv().await {
        Some(Packet::Publish(publish)) => {
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            assert!(!publish.dup);
            assert!(!publish.retain);
            let packet_id = publish.packet_id.unwrap();
            sub.send(&Packet::PubAck(embermq::protocol::PubAck { packet_id }))
                .await;
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}
