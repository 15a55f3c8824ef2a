//! Mock protocol engines for testing
//!
//! [`MockEngine`] records every request it receives and never touches the
//! network. [`MockEngineFactory`] keeps each engine it builds together with
//! the engine's event sink, so tests can play the broker and push callbacks
//! into the connection manager.

use crate::engine::{
    EngineError, EngineEvent, EngineEventSink, EngineFactory, MessageId, PacketIdSequence,
    ProtocolEngine,
};
use crate::session::{QoS, SessionId, SessionParameters};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One request observed by a [`MockEngine`]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Connect,
    Disconnect,
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Recording engine. Clones share the same call log.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    fail_connect: Arc<AtomicBool>,
    fail_requests: Arc<AtomicBool>,
    packet_ids: Arc<Mutex<PacketIdSequence>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose `connect` is rejected
    pub fn with_connect_failure() -> Self {
        let engine = Self::default();
        engine.fail_connect.store(true, Ordering::SeqCst);
        engine
    }

    /// Make subscribe/unsubscribe/publish fail from now on
    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Act as a CONNACK carrying this receive maximum
    pub fn set_receive_maximum(&self, receive_max: u16) {
        guard(&self.packet_ids)
            .limit()
            .apply_receive_maximum(Some(receive_max));
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        guard(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        guard(&self.calls).clear();
    }

    /// Number of recorded calls equal to `call`
    pub fn count(&self, call: &EngineCall) -> usize {
        guard(&self.calls).iter().filter(|c| *c == call).count()
    }

    pub fn published(&self) -> Vec<EngineCall> {
        guard(&self.calls)
            .iter()
            .filter(|c| matches!(c, EngineCall::Publish { .. }))
            .cloned()
            .collect()
    }

    fn record(&self, call: EngineCall) {
        guard(&self.calls).push(call);
    }

    fn next_packet_id(&self) -> MessageId {
        guard(&self.packet_ids).next_id()
    }

    fn check_requests(&self) -> Result<(), EngineError> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(EngineError::Request("mock request failure".to_string().into()));
        }
        Ok(())
    }
}

impl ProtocolEngine for MockEngine {
    fn connect(&mut self) -> Result<(), EngineError> {
        self.record(EngineCall::Connect);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(EngineError::Request("mock connect failure".to_string().into()));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.record(EngineCall::Disconnect);
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), EngineError> {
        self.check_requests()?;
        self.record(EngineCall::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        self.next_packet_id();
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), EngineError> {
        self.check_requests()?;
        self.record(EngineCall::Unsubscribe {
            topic: topic.to_string(),
        });
        self.next_packet_id();
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, EngineError> {
        self.check_requests()?;
        self.record(EngineCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });

        if qos == QoS::AtMostOnce {
            return Ok(0);
        }
        Ok(self.next_packet_id())
    }
}

/// An engine built by [`MockEngineFactory`], with the sink handed to it
#[derive(Debug, Clone)]
pub struct CreatedEngine {
    pub session: SessionId,
    pub params: SessionParameters,
    pub engine: MockEngine,
    pub sink: EngineEventSink,
}

impl CreatedEngine {
    /// Deliver an event as the engine's background task would
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.sink.emit(event)
    }

    pub fn accept(&self) -> bool {
        self.emit(EngineEvent::ConnectAck {
            accepted: true,
            reason_code: 0,
        })
    }

    pub fn refuse(&self, reason_code: u8) -> bool {
        self.emit(EngineEvent::ConnectAck {
            accepted: false,
            reason_code,
        })
    }

    pub fn drop_connection(&self, error: &str) -> bool {
        self.emit(EngineEvent::Disconnected {
            error: Some(error.to_string()),
        })
    }

    pub fn deliver(&self, topic: &str, payload: &'static [u8], message_id: MessageId) -> bool {
        self.emit(EngineEvent::MessageReceived {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
            qos: QoS::AtMostOnce,
            message_id,
        })
    }
}

/// Factory that hands out [`MockEngine`]s and remembers them
#[derive(Debug, Default)]
pub struct MockEngineFactory {
    created: Mutex<Vec<CreatedEngine>>,
    fail_create: AtomicBool,
    fail_connect: AtomicBool,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `create` fail
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Build engines whose `connect` fails
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        guard(&self.created).len()
    }

    pub fn latest(&self) -> Option<CreatedEngine> {
        guard(&self.created).last().cloned()
    }

    pub fn for_session(&self, session: SessionId) -> Option<CreatedEngine> {
        guard(&self.created)
            .iter()
            .find(|created| created.session == session)
            .cloned()
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        params: &SessionParameters,
        sink: EngineEventSink,
    ) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Create("mock factory failure".to_string()));
        }

        let engine = if self.fail_connect.load(Ordering::SeqCst) {
            MockEngine::with_connect_failure()
        } else {
            MockEngine::new()
        };

        guard(&self.created).push(CreatedEngine {
            session: sink.session(),
            params: params.clone(),
            engine: engine.clone(),
            sink,
        });
        Ok(Box::new(engine))
    }
}
