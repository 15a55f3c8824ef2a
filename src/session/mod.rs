//! One broker connection: identity, subscription, counters and message buffer
//!
//! A [`Session`] owns exactly one protocol engine handle for its whole life.
//! Reconnecting to a different broker (or after a teardown) means building a
//! new session with a new [`SessionId`]; the handle is never reused.
//!
//! Sessions are not internally synchronized. The connection manager keeps the
//! active session behind its lock and applies engine events one at a time.

pub mod buffer;
pub mod qos;
pub mod throttle;

pub use buffer::{MessageBuffer, MessageRecord, DEFAULT_BUFFER_CAPACITY};
pub use qos::QoS;
pub use throttle::{ReconnectThrottle, ThrottleVerdict, DEFAULT_STORM_CEILING, DEFAULT_STORM_WINDOW};

use crate::engine::{EngineEvent, MessageId, ProtocolEngine};
use crate::error::{sanitize_reason, SessionError, SessionResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Monotonically increasing session identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Connection parameters. Immutable once a session is built from them.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionParameters {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
}

/// Borrowed username/password pair
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

impl SessionParameters {
    /// Anonymous, clean-session parameters
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            clean_session: true,
        }
    }

    /// Build parameters from user-entered text, validating the port
    pub fn parse(
        host: impl Into<String>,
        port: &str,
        client_id: impl Into<String>,
    ) -> SessionResult<Self> {
        let port = parse_port(port)?;
        Ok(Self::new(host, port, client_id))
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Credentials are only used when both halves are present
    pub fn credentials(&self) -> Option<Credentials<'_>> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.credentials().is_none()
    }
}

impl fmt::Debug for SessionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParameters")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("clean_session", &self.clean_session)
            .finish()
    }
}

/// Parse a port typed by a user. Non-numeric or out-of-range text is rejected.
pub fn parse_port(text: &str) -> SessionResult<u16> {
    text.trim()
        .parse::<u16>()
        .map_err(|_| SessionError::InvalidPort(text.to_string()))
}

/// The single tracked subscription of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

/// Limits applied to every session a manager creates
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub buffer_capacity: usize,
    pub storm_ceiling: u32,
    pub storm_window: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            storm_ceiling: DEFAULT_STORM_CEILING,
            storm_window: DEFAULT_STORM_WINDOW,
        }
    }
}

/// What a session reports upward after handling an engine event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    ConnectRefused { reason_code: u8, reason: String },
    /// `reason` is `None` for a clean, expected disconnect
    Disconnected { reason: Option<String> },
    /// The throttle tripped and the session tore itself down
    StormDetected { disconnects: u32 },
    MessageReceived,
    PublishAcknowledged { message_id: MessageId },
}

/// Consistent snapshot of a session's counters and identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub subscription: Option<Subscription>,
    pub buffered_messages: usize,
}

pub struct Session {
    id: SessionId,
    params: SessionParameters,
    engine: Option<Box<dyn ProtocolEngine>>,
    subscription: Option<Subscription>,
    buffer: MessageBuffer,
    messages_sent: u64,
    messages_received: u64,
    connected_at: Option<DateTime<Utc>>,
    throttle: ReconnectThrottle,
    new_message: bool,
}

impl Session {
    pub fn new(
        id: SessionId,
        params: SessionParameters,
        engine: Box<dyn ProtocolEngine>,
        settings: &SessionSettings,
    ) -> Self {
        Self {
            id,
            params,
            engine: Some(engine),
            subscription: None,
            buffer: MessageBuffer::with_capacity(settings.buffer_capacity),
            messages_sent: 0,
            messages_received: 0,
            connected_at: None,
            throttle: ReconnectThrottle::new(settings.storm_ceiling, settings.storm_window),
            new_message: false,
        }
    }

    /// Start connecting. The outcome arrives later as a `ConnectAck` event.
    pub fn connect(&mut self) -> SessionResult<()> {
        // A clean session discards whatever we meant to resubscribe to
        if self.params.clean_session {
            self.subscription = None;
        }
        self.throttle.reset();

        let engine = self.engine.as_mut().ok_or(SessionError::EngineUnavailable)?;
        info!(
            session_id = %self.id,
            host = %self.params.host,
            port = self.params.port,
            client_id = %self.params.client_id,
            clean_session = self.params.clean_session,
            "Connecting to broker"
        );
        engine.connect()?;
        Ok(())
    }

    /// Release the engine. Idempotent; returns true only when a handle was released.
    pub fn disconnect(&mut self) -> bool {
        let Some(mut engine) = self.engine.take() else {
            return false;
        };

        engine.disconnect();
        self.connected_at = None;
        self.subscription = None;
        self.throttle.reset();
        info!(session_id = %self.id, "Session disconnected");
        true
    }

    /// Track `(topic, qos)` as the one subscription and forward it. Replaces any
    /// earlier subscription record.
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> SessionResult<()> {
        if topic.is_empty() {
            return Err(SessionError::InvalidTopic(topic.to_string()));
        }
        let engine = self.engine.as_mut().ok_or(SessionError::EngineUnavailable)?;

        self.subscription = Some(Subscription {
            topic: topic.to_string(),
            qos,
        });
        debug!(session_id = %self.id, topic, qos = qos.level(), "Subscribing");
        engine.subscribe(topic, qos)?;
        Ok(())
    }

    pub fn unsubscribe(&mut self) -> SessionResult<()> {
        let engine = self.engine.as_mut().ok_or(SessionError::EngineUnavailable)?;

        if let Some(subscription) = self.subscription.take() {
            debug!(session_id = %self.id, topic = %subscription.topic, "Unsubscribing");
            engine.unsubscribe(&subscription.topic)?;
        }
        Ok(())
    }

    /// Queue a publish. The sent counter moves when the engine confirms it.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<MessageId> {
        if topic.is_empty() {
            return Err(SessionError::InvalidTopic(topic.to_string()));
        }
        let engine = self.engine.as_mut().ok_or(SessionError::EngineUnavailable)?;
        let message_id = engine.publish(topic, payload, qos, retain)?;
        debug!(session_id = %self.id, topic, message_id, retain, "Publish queued");
        Ok(message_id)
    }

    /// Apply one engine callback
    pub fn handle_engine_event(&mut self, event: EngineEvent) -> SessionEvent {
        match event {
            EngineEvent::ConnectAck {
                accepted,
                reason_code,
            } => self.on_connect_ack(accepted, reason_code),
            EngineEvent::Disconnected { error } => self.on_disconnected(error, Instant::now()),
            EngineEvent::MessageReceived {
                topic,
                payload,
                qos,
                message_id,
            } => {
                self.on_message_received(topic, payload, qos, message_id);
                SessionEvent::MessageReceived
            }
            EngineEvent::PublishAck { message_id } => {
                self.on_publish_ack(message_id);
                SessionEvent::PublishAcknowledged { message_id }
            }
        }
    }

    pub fn on_connect_ack(&mut self, accepted: bool, reason_code: u8) -> SessionEvent {
        if !accepted {
            let reason = format!("Connection refused: {}", describe_connect_code(reason_code));
            warn!(session_id = %self.id, reason_code, "{}", reason);
            return SessionEvent::ConnectRefused {
                reason_code,
                reason,
            };
        }

        self.connected_at = Some(Utc::now());
        self.throttle.reset();
        info!(session_id = %self.id, "Connection accepted");

        // Resubscribe after reconnect
        if let Some(subscription) = self.subscription.clone() {
            if let Err(e) = self.subscribe(&subscription.topic, subscription.qos) {
                warn!(session_id = %self.id, topic = %subscription.topic, "Failed to re-subscribe: {}", e);
            }
        }

        SessionEvent::Connected
    }

    pub fn on_message_received(&mut self, topic: String, payload: Bytes, qos: QoS, message_id: MessageId) {
        let record = MessageRecord::new(topic, payload, qos, message_id);
        debug!(session_id = %self.id, topic = %record.topic, message_id, "Message received");
        self.messages_received += 1;
        self.buffer.insert(record);
        self.new_message = true;
    }

    pub fn on_publish_ack(&mut self, message_id: MessageId) {
        self.messages_sent += 1;
        debug!(session_id = %self.id, message_id, "Publish confirmed");
    }

    /// Record a disconnect against the throttle; a storm tears the session down
    pub fn on_disconnected(&mut self, error: Option<String>, now: Instant) -> SessionEvent {
        let reason = error.as_deref().map(sanitize_reason);
        self.connected_at = None;

        match self.throttle.record_disconnect(now) {
            ThrottleVerdict::Storm => {
                let disconnects = self.throttle.count();
                tracing::error!(
                    session_id = %self.id,
                    disconnects,
                    "Reconnect storm detected, forcing disconnect"
                );
                self.disconnect();
                SessionEvent::StormDetected { disconnects }
            }
            ThrottleVerdict::Calm => {
                match &reason {
                    Some(reason) => warn!(session_id = %self.id, "Connection lost: {}", reason),
                    None => info!(session_id = %self.id, "Clean disconnect"),
                }
                SessionEvent::Disconnected { reason }
            }
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn parameters(&self) -> &SessionParameters {
        &self.params
    }

    /// True while the session still holds its engine handle
    pub fn is_active(&self) -> bool {
        self.engine.is_some()
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at
            .map(|at| (Utc::now() - at).to_std().unwrap_or_default())
    }

    pub fn throttle(&self) -> &ReconnectThrottle {
        &self.throttle
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.buffer.list()
    }

    pub fn messages_for_topic(&self, topic: &str) -> Vec<MessageRecord> {
        self.buffer.list_for_topic(topic)
    }

    pub fn clear_messages(&mut self) {
        self.buffer.clear();
        self.new_message = false;
    }

    pub fn has_new_message(&self) -> bool {
        self.new_message
    }

    /// Read and clear the "new message available" flag
    pub fn take_new_message(&mut self) -> bool {
        std::mem::take(&mut self.new_message)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id,
            host: self.params.host.clone(),
            port: self.params.port,
            client_id: self.params.client_id.clone(),
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            connected_at: self.connected_at,
            uptime_secs: self.uptime().map(|d| d.as_secs()),
            subscription: self.subscription.clone(),
            buffered_messages: self.buffer.len(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("active", &self.is_active())
            .field("subscription", &self.subscription)
            .field("messages_sent", &self.messages_sent)
            .field("messages_received", &self.messages_received)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Human-readable text for CONNACK reason codes (MQTT 3.1.1 and 5)
pub fn describe_connect_code(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        0x80 => "unspecified error",
        0x81 => "malformed packet",
        0x82 => "protocol error",
        0x84 => "unsupported protocol version",
        0x85 => "client identifier not valid",
        0x86 => "bad user name or password",
        0x87 => "not authorized",
        0x88 => "server unavailable",
        0x89 => "server busy",
        0x8A => "banned",
        0x8C => "bad authentication method",
        0x97 => "quota exceeded",
        _ => "unknown reason",
    }
}

/// Render an uptime as `HH:MM:SS`
pub fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
