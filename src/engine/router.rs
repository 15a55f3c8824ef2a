//! Pure mapping from rumqttc event-loop output to engine events
//!
//! Keeps the polling task free of decision logic so routing can be tested
//! without a broker.

use super::EngineEvent;
use crate::session::QoS;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::mqttbytes::QoS as WireQoS;
use rumqttc::v5::{ConnectionError, Event};
use rumqttc::Outgoing;
use tracing::debug;

/// Stateless routing decisions for rumqttc events
pub struct EventRouter;

impl EventRouter {
    /// Route one successfully polled event. `None` means the event is
    /// infrastructure noise (pings, SUBACKs, outgoing bookkeeping).
    pub fn route_event(event: &Event) -> Option<EngineEvent> {
        match event {
            Event::Incoming(packet) => Self::route_incoming(packet),
            // QoS 0 publishes are complete once written; they carry packet id 0
            Event::Outgoing(Outgoing::Publish(0)) => {
                Some(EngineEvent::PublishAck { message_id: 0 })
            }
            Event::Outgoing(_) => None,
        }
    }

    fn route_incoming(packet: &Packet) -> Option<EngineEvent> {
        match packet {
            Packet::ConnAck(connack) => Some(Self::connack_event(connack.code)),
            Packet::Publish(publish) => Some(EngineEvent::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
                qos: Self::from_wire_qos(publish.qos),
                message_id: publish.pkid,
            }),
            Packet::PubAck(ack) => Some(EngineEvent::PublishAck {
                message_id: ack.pkid,
            }),
            Packet::PubComp(comp) => Some(EngineEvent::PublishAck {
                message_id: comp.pkid,
            }),
            other => {
                debug!(target: "mqtt_engine", "Ignoring MQTT packet: {:?}", other);
                None
            }
        }
    }

    fn connack_event(code: ConnectReturnCode) -> EngineEvent {
        match code {
            ConnectReturnCode::Success => EngineEvent::ConnectAck {
                accepted: true,
                reason_code: 0,
            },
            refused => EngineEvent::ConnectAck {
                accepted: false,
                reason_code: refused as u8,
            },
        }
    }

    /// Route an event-loop error. A refused CONNACK surfaces as an error in
    /// rumqttc, everything else is a lost connection. A broker DISCONNECT also
    /// lands here, as a `ServerDisconnect` state error.
    pub fn route_error(error: &ConnectionError) -> EngineEvent {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::connack_event(*code),
            other => EngineEvent::Disconnected {
                error: Some(other.to_string()),
            },
        }
    }

    pub fn to_wire_qos(qos: QoS) -> WireQoS {
        match qos {
            QoS::AtMostOnce => WireQoS::AtMostOnce,
            QoS::AtLeastOnce => WireQoS::AtLeastOnce,
            QoS::ExactlyOnce => WireQoS::ExactlyOnce,
        }
    }

    pub fn from_wire_qos(qos: WireQoS) -> QoS {
        match qos {
            WireQoS::AtMostOnce => QoS::AtMostOnce,
            WireQoS::AtLeastOnce => QoS::AtLeastOnce,
            WireQoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}
