//! Protocol engine boundary
//!
//! The session core never talks to sockets. It drives a [`ProtocolEngine`]
//! (connect, subscribe, publish, ...) and the engine reports back through an
//! [`EngineEventSink`], which tags every event with the session that owns the
//! engine. All events from all engines funnel into one channel consumed by the
//! connection manager, so events are applied in delivery order and events for
//! superseded sessions can be recognized and dropped.

use crate::session::{QoS, SessionId, SessionParameters};
use bytes::Bytes;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;
pub mod router;

pub use mqtt::{EngineOptions, MqttEngine, MqttEngineFactory, ReconnectConfig};

/// Packet identifier of a published message
pub type MessageId = u16;

/// Ceiling on packet identifiers, shared between an engine and its polling
/// task. Starts at the configured bound and drops to the broker's receive
/// maximum when a CONNACK carries one.
#[derive(Debug, Clone)]
pub struct InflightLimit {
    upper: MessageId,
    current: Arc<AtomicU16>,
}

impl InflightLimit {
    pub fn new(upper: MessageId) -> Self {
        let upper = upper.max(1);
        Self {
            upper,
            current: Arc::new(AtomicU16::new(upper)),
        }
    }

    pub fn get(&self) -> MessageId {
        self.current.load(Ordering::SeqCst)
    }

    /// A CONNACK without a receive maximum keeps the previous limit
    pub fn apply_receive_maximum(&self, receive_max: Option<u16>) {
        if let Some(receive_max) = receive_max {
            self.current
                .store(receive_max.clamp(1, self.upper), Ordering::SeqCst);
        }
    }
}

impl Default for InflightLimit {
    fn default() -> Self {
        Self::new(MessageId::MAX)
    }
}

/// Packet identifiers in the order rumqttc hands them out. SUBSCRIBE,
/// UNSUBSCRIBE and QoS 1/2 PUBLISH all draw from this one sequence, which
/// runs `1..=limit` and then starts over at 1.
#[derive(Debug, Clone, Default)]
pub struct PacketIdSequence {
    last: MessageId,
    limit: InflightLimit,
}

impl PacketIdSequence {
    pub fn new(limit: InflightLimit) -> Self {
        Self { last: 0, limit }
    }

    pub fn limit(&self) -> &InflightLimit {
        &self.limit
    }

    pub fn next_id(&mut self) -> MessageId {
        let next = self.last.checked_add(1).unwrap_or(1);
        self.last = if next >= self.limit.get() { 0 } else { next };
        next
    }
}

/// Engine-level failures. These only cover requests that could not be queued;
/// network outcomes arrive as [`EngineEvent`]s.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine could not be created: {0}")]
    Create(String),
    #[error("Engine already started")]
    AlreadyStarted,
    #[error("Engine request rejected")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("No async runtime available to drive the engine")]
    NoRuntime,
}

/// Callbacks delivered by the engine's background context
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Broker answered the CONNECT
    ConnectAck { accepted: bool, reason_code: u8 },
    /// Connection ended. `None` means a clean, expected disconnect.
    Disconnected { error: Option<String> },
    /// PUBLISH received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: QoS,
        message_id: MessageId,
    },
    /// Outgoing publish confirmed for its QoS level
    PublishAck { message_id: MessageId },
}

/// Event tagged with the session that produced it
#[derive(Debug, Clone)]
pub struct EngineEnvelope {
    pub session: SessionId,
    pub event: EngineEvent,
}

/// Handle an engine uses to push events toward the manager
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<EngineEnvelope>,
}

impl EngineEventSink {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<EngineEnvelope>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns false once the receiving side is gone
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(EngineEnvelope {
                session: self.session,
                event,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Black-box MQTT client driven by a session.
///
/// Every call is fire-and-forget: it queues the request and returns. Errors
/// only mean the request could not be queued.
pub trait ProtocolEngine: Send {
    fn connect(&mut self) -> Result<(), EngineError>;

    /// Best-effort; must tolerate being called on a dead connection
    fn disconnect(&mut self);

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), EngineError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), EngineError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, EngineError>;
}

/// Builds one engine per session
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        params: &SessionParameters,
        sink: EngineEventSink,
    ) -> Result<Box<dyn ProtocolEngine>, EngineError>;
}
