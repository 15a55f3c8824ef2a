//! Connection manager: the single owner of connection state
//!
//! Holds at most one [`Session`] and the consumer-facing [`ConnectionState`].
//! Every mutation (consumer actions and engine callbacks alike) happens under
//! one lock, and engine callbacks are drained in delivery order by a single
//! reducer task. Callbacks tagged with a superseded [`SessionId`] are dropped.
//!
//! Consumers observe the manager two ways:
//! - a broadcast stream of [`StateChange`] notifications, one per transition;
//! - a "new message available" signal, either polled with
//!   [`ConnectionManager::take_new_message`] or awaited on the watch channel
//!   from [`ConnectionManager::message_signal`].
//!
//! One manager is meant to live for the whole process. It is constructed
//! explicitly and shared by cloning the handle; tests build independent ones.

use crate::engine::{EngineEnvelope, EngineEvent, EngineEventSink, EngineFactory, MessageId};
use crate::error::{sanitize_reason, SessionError, SessionResult};
use crate::session::{
    MessageRecord, QoS, Session, SessionEvent, SessionId, SessionParameters, SessionSettings,
    SessionStats, Subscription,
};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Buffered notifications per subscriber before slow receivers start lagging
const NOTIFICATION_CAPACITY: usize = 64;

/// Consumer-facing connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a notification was emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeCause {
    ConnectRequested,
    /// The engine reconnected a session that had dropped to `Disconnected`
    EngineReconnecting,
    Accepted,
    Refused { code: u8 },
    /// The engine could not even start connecting
    ConnectFailed,
    ConnectionLost,
    ClosedCleanly,
    Cancelled,
    UserDisconnect,
    StormDetected { disconnects: u32 },
}

/// One state-change notification
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub session: SessionId,
    pub previous: ConnectionState,
    pub state: ConnectionState,
    pub cause: ChangeCause,
    /// Human-readable, sanitized
    pub reason: String,
}

impl StateChange {
    /// The asynchronous failure this notification reports, if any
    pub fn error(&self) -> Option<SessionError> {
        match &self.cause {
            ChangeCause::Refused { code } => Some(SessionError::ConnectRefused {
                code: *code,
                reason: self.reason.clone(),
            }),
            ChangeCause::StormDetected { disconnects } => Some(SessionError::StormDetected {
                disconnects: *disconnects,
            }),
            _ => None,
        }
    }
}

struct ManagerState {
    connection: ConnectionState,
    session: Option<Session>,
    last_session_id: SessionId,
}

struct Shared {
    state: Mutex<ManagerState>,
    notifications: broadcast::Sender<StateChange>,
    message_signal: watch::Sender<u64>,
    engine_tx: mpsc::UnboundedSender<EngineEnvelope>,
    factory: Arc<dyn EngineFactory>,
    settings: SessionSettings,
}

/// Cloneable handle to the process-wide connection manager
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Build a manager and spawn its reducer task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(factory: Arc<dyn EngineFactory>, settings: SessionSettings) -> Self {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (message_signal, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState {
                connection: ConnectionState::Disconnected,
                session: None,
                last_session_id: SessionId::new(0),
            }),
            notifications,
            message_signal,
            engine_tx,
            factory,
            settings,
        });

        tokio::spawn(Self::run_reducer(Arc::downgrade(&shared), engine_rx));
        Self { shared }
    }

    /// Drain engine events in delivery order until every sender is gone
    async fn run_reducer(shared: Weak<Shared>, mut engine_rx: mpsc::UnboundedReceiver<EngineEnvelope>) {
        while let Some(envelope) = engine_rx.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            ConnectionManager { shared }.apply_engine_event(envelope.session, envelope.event);
        }
        debug!("Connection manager reducer stopped");
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new session. Fails without side effects unless the manager is
    /// `Disconnected`; it never interrupts an in-flight session on its own.
    pub fn start_connect(&self, params: SessionParameters) -> SessionResult<SessionId> {
        let mut state = self.lock();
        match state.connection {
            ConnectionState::Connecting => return Err(SessionError::AlreadyConnecting),
            ConnectionState::Connected => return Err(SessionError::AlreadyConnected),
            ConnectionState::Disconnected => {}
        }

        let id = state.last_session_id.next();
        let _span = crate::session_span!(session_id = %id).entered();

        let sink = EngineEventSink::new(id, self.shared.engine_tx.clone());
        let engine = self
            .shared
            .factory
            .create(&params, sink)
            .map_err(SessionError::EngineCreateFailed)?;
        state.last_session_id = id;

        if let Some(mut dormant) = state.session.take() {
            debug!(previous = %dormant.id(), "Releasing dormant session");
            dormant.disconnect();
        }

        let target = format!("{}:{}", params.host, params.port);
        state.session = Some(Session::new(id, params, engine, &self.shared.settings));
        self.transition(
            &mut state,
            id,
            ConnectionState::Connecting,
            ChangeCause::ConnectRequested,
            format!("Connecting to {target}"),
        );

        let connected = match state.session.as_mut() {
            Some(session) => session.connect(),
            None => Err(SessionError::EngineUnavailable),
        };
        if let Err(e) = connected {
            error!("Failed to start connecting: {}", e);
            Self::release_session(&mut state);
            self.transition(
                &mut state,
                id,
                ConnectionState::Disconnected,
                ChangeCause::ConnectFailed,
                e.to_string(),
            );
            return Err(e);
        }

        Ok(id)
    }

    /// Cancel a pending connect or close an established connection. Ends in
    /// `Disconnected`; a no-op (apart from releasing a dormant session) when
    /// already disconnected.
    pub fn cancel_or_disconnect(&self) {
        let mut state = self.lock();
        let id = Self::current_id(&state);

        let (cause, reason) = match state.connection {
            ConnectionState::Disconnected => {
                if Self::release_session(&mut state) {
                    debug!(session_id = %id, "Released dormant session");
                }
                return;
            }
            ConnectionState::Connecting => (ChangeCause::Cancelled, "Connection attempt cancelled"),
            ConnectionState::Connected => (ChangeCause::UserDisconnect, "Disconnected by user"),
        };

        // Local transition; the engine is only told to disconnect, never awaited
        Self::release_session(&mut state);
        self.transition(&mut state, id, ConnectionState::Disconnected, cause, reason.to_string());
    }

    /// Apply one engine callback. Events for any session other than the
    /// current one are discarded.
    pub fn apply_engine_event(&self, session: SessionId, event: EngineEvent) {
        let mut state = self.lock();

        let outcome = match state.session.as_mut() {
            Some(current) if current.id() == session => current.handle_engine_event(event),
            _ => {
                debug!(session_id = %session, "Discarding event for stale session: {:?}", event);
                return;
            }
        };

        match outcome {
            SessionEvent::Connected => self.on_connected(&mut state, session),
            SessionEvent::ConnectRefused {
                reason_code,
                reason,
            } => {
                Self::release_session(&mut state);
                self.settle_disconnected(&mut state, session, ChangeCause::Refused { code: reason_code }, reason, true);
            }
            SessionEvent::Disconnected { reason: None } => {
                Self::release_session(&mut state);
                self.settle_disconnected(
                    &mut state,
                    session,
                    ChangeCause::ClosedCleanly,
                    "Clean disconnect".to_string(),
                    false,
                );
            }
            SessionEvent::Disconnected {
                reason: Some(reason),
            } => {
                // Keep the session: its engine retries and the throttle keeps counting
                self.settle_disconnected(&mut state, session, ChangeCause::ConnectionLost, reason, false);
            }
            SessionEvent::StormDetected { disconnects } => {
                Self::release_session(&mut state);
                self.settle_disconnected(
                    &mut state,
                    session,
                    ChangeCause::StormDetected { disconnects },
                    format!("Forced disconnect: reconnect storm detected ({disconnects} disconnects)"),
                    true,
                );
            }
            SessionEvent::MessageReceived => {
                self.shared
                    .message_signal
                    .send_modify(|count| *count = count.wrapping_add(1));
            }
            SessionEvent::PublishAcknowledged { .. } => {}
        }
    }

    fn on_connected(&self, state: &mut ManagerState, session: SessionId) {
        match state.connection {
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected => {
                self.transition(
                    state,
                    session,
                    ConnectionState::Connecting,
                    ChangeCause::EngineReconnecting,
                    "Engine reconnected".to_string(),
                );
            }
            ConnectionState::Connected => {
                debug!(session_id = %session, "Duplicate connect acknowledgment");
                return;
            }
        }
        self.transition(
            state,
            session,
            ConnectionState::Connected,
            ChangeCause::Accepted,
            "Connection accepted".to_string(),
        );
    }

    /// Move to `Disconnected`. When the state already is `Disconnected` a
    /// notification is only sent if `always_notify` is set, which is used when
    /// a refusal or a storm destroys a dormant session.
    fn settle_disconnected(
        &self,
        state: &mut ManagerState,
        session: SessionId,
        cause: ChangeCause,
        reason: String,
        always_notify: bool,
    ) {
        if state.connection != ConnectionState::Disconnected {
            self.transition(state, session, ConnectionState::Disconnected, cause, reason);
        } else if always_notify {
            self.notify(StateChange {
                session,
                previous: ConnectionState::Disconnected,
                state: ConnectionState::Disconnected,
                cause,
                reason: sanitize_reason(&reason),
            });
        }
    }

    fn transition(
        &self,
        state: &mut ManagerState,
        session: SessionId,
        to: ConnectionState,
        cause: ChangeCause,
        reason: String,
    ) {
        let from = state.connection;
        if from == to {
            return;
        }
        state.connection = to;

        let change = StateChange {
            session,
            previous: from,
            state: to,
            cause,
            reason: sanitize_reason(&reason),
        };
        log_state_transition(&change);
        self.notify(change);
    }

    fn notify(&self, change: StateChange) {
        // No receivers is fine, notifications are advisory
        let _ = self.shared.notifications.send(change);
    }

    /// Returns true if a session was dropped
    fn release_session(state: &mut ManagerState) -> bool {
        match state.session.take() {
            Some(mut session) => {
                session.disconnect();
                true
            }
            None => false,
        }
    }

    fn current_id(state: &ManagerState) -> SessionId {
        state
            .session
            .as_ref()
            .map(Session::id)
            .unwrap_or(state.last_session_id)
    }

    /// Run a request against the current session. A dormant session is
    /// reported as not connected.
    fn with_session<T>(&self, op: impl FnOnce(&mut Session) -> SessionResult<T>) -> SessionResult<T> {
        let mut state = self.lock();
        if state.connection == ConnectionState::Disconnected {
            return Err(SessionError::NotConnected);
        }
        let session = state.session.as_mut().ok_or(SessionError::NotConnected)?;
        op(session)
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> SessionResult<()> {
        self.with_session(|session| session.subscribe(topic, qos))
    }

    pub fn unsubscribe(&self) -> SessionResult<()> {
        self.with_session(Session::unsubscribe)
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<MessageId> {
        let payload = payload.into();
        self.with_session(|session| session.publish(topic, payload, qos, retain))
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.lock().session.as_ref().map(Session::id)
    }

    /// Stream of state-change notifications
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.shared.notifications.subscribe()
    }

    /// Counter bumped on every received message, for push-style consumers
    pub fn message_signal(&self) -> watch::Receiver<u64> {
        self.shared.message_signal.subscribe()
    }

    /// Poll-and-clear the "new message available" flag
    pub fn take_new_message(&self) -> bool {
        self.lock()
            .session
            .as_mut()
            .map(Session::take_new_message)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> Option<SessionStats> {
        self.lock().session.as_ref().map(Session::stats)
    }

    pub fn subscription(&self) -> Option<Subscription> {
        self.lock().session.as_ref().and_then(|s| s.subscription().cloned())
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.lock()
            .session
            .as_ref()
            .map(Session::messages)
            .unwrap_or_default()
    }

    pub fn messages_for_topic(&self, topic: &str) -> Vec<MessageRecord> {
        self.lock()
            .session
            .as_ref()
            .map(|s| s.messages_for_topic(topic))
            .unwrap_or_default()
    }

    pub fn clear_messages(&self) {
        if let Some(session) = self.lock().session.as_mut() {
            session.clear_messages();
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ConnectionManager")
            .field("connection", &state.connection)
            .field("session", &state.session)
            .finish()
    }
}

fn log_state_transition(change: &StateChange) {
    match (&change.previous, &change.state, &change.cause) {
        (_, ConnectionState::Connected, _) => {
            info!(session_id = %change.session, "MQTT connection established");
        }
        (_, _, ChangeCause::StormDetected { disconnects }) => {
            error!(session_id = %change.session, disconnects, "Session closed after reconnect storm");
        }
        (_, _, ChangeCause::Refused { code }) => {
            warn!(session_id = %change.session, code, "{}", change.reason);
        }
        (ConnectionState::Connected, ConnectionState::Disconnected, ChangeCause::ConnectionLost) => {
            warn!(session_id = %change.session, "MQTT connection lost: {}", change.reason);
        }
        _ => {
            info!(
                session_id = %change.session,
                "MQTT connection state: {} -> {} ({})",
                change.previous,
                change.state,
                change.reason
            );
        }
    }
}
