//! rumqttc engine against a scripted broker socket
//!
//! The broker side reads raw MQTT v5 packets so the packet identifiers rumqttc
//! puts on the wire can be compared with the ids the engine hands back.

use bytes::Bytes;
use mqtt_session::engine::{
    EngineEnvelope, EngineEvent, EngineEventSink, EngineOptions, MqttEngine, ProtocolEngine,
};
use mqtt_session::{QoS, SessionId, SessionParameters};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;

/// Read one packet, returning its type nibble and body
async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = stream.read_u8().await.unwrap();
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.unwrap();
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await.unwrap();
    (header >> 4, body)
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

async fn wait_for(
    rx: &mut UnboundedReceiver<EngineEnvelope>,
    wanted: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.expect("engine channel open");
            if wanted(&envelope.event) {
                return envelope.event;
            }
        }
    })
    .await
    .expect("engine event should arrive")
}

#[tokio::test]
async fn test_publish_id_matches_wire_packet_id_after_subscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (kind, _) = read_packet(&mut stream).await;
        assert_eq!(kind, CONNECT);
        // CONNACK: no session present, success, empty properties
        stream.write_all(&[0x20, 0x03, 0x00, 0x00, 0x00]).await.unwrap();

        let (kind, body) = read_packet(&mut stream).await;
        assert_eq!(kind, SUBSCRIBE);
        let subscribe_id = be_u16(&body);

        let (kind, body) = read_packet(&mut stream).await;
        assert_eq!(kind, PUBLISH);
        let topic_len = be_u16(&body) as usize;
        let publish_id = be_u16(&body[2 + topic_len..]);

        let [hi, lo] = publish_id.to_be_bytes();
        stream.write_all(&[0x40, 0x02, hi, lo]).await.unwrap();

        (subscribe_id, publish_id, stream)
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = EngineEventSink::new(SessionId::new(1), tx);
    let params = SessionParameters::new("127.0.0.1", port, "packet-id-check");
    let mut engine = MqttEngine::new(&params, &EngineOptions::default(), sink);
    engine.connect().unwrap();

    wait_for(&mut rx, |event| {
        matches!(event, EngineEvent::ConnectAck { accepted: true, .. })
    })
    .await;

    engine.subscribe("alerts/#", QoS::AtLeastOnce).unwrap();
    let message_id = engine
        .publish("cmd/light", Bytes::from_static(b"on"), QoS::AtLeastOnce, false)
        .unwrap();

    let (subscribe_id, publish_id, _stream) = timeout(Duration::from_secs(5), broker)
        .await
        .expect("broker should see both packets")
        .unwrap();
    assert_eq!(subscribe_id, 1);
    assert_eq!(publish_id, message_id);
    assert_eq!(message_id, 2);

    let acked = wait_for(&mut rx, |event| {
        matches!(event, EngineEvent::PublishAck { .. })
    })
    .await;
    assert_eq!(acked, EngineEvent::PublishAck { message_id });

    engine.disconnect();
}
