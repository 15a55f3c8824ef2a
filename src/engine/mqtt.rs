//! rumqttc-backed protocol engine
//!
//! One [`MqttEngine`] per session. `connect` spawns a polling task that drives
//! the rumqttc event loop and forwards routed events through the session's
//! [`EngineEventSink`]. After a network error the task waits per the
//! [`ReconnectConfig`] backoff and polls again, which makes rumqttc reconnect.
//! The session's storm throttle is what ends that cycle.

use super::router::EventRouter;
use super::{
    EngineError, EngineEvent, EngineEventSink, EngineFactory, InflightLimit, MessageId,
    PacketIdSequence, ProtocolEngine,
};
use crate::session::{QoS, SessionParameters};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Outgoing;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Request queue capacity handed to rumqttc
const REQUEST_CAPACITY: usize = 64;

/// How long a disconnecting engine may keep polling to flush DISCONNECT
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay schedule between automatic reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![500, 1000, 2000, 5000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Engine-wide knobs that are not part of a session's identity
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub keep_alive: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Pure function to build rumqttc options from session parameters
pub fn configure_mqtt_options(params: &SessionParameters, options: &EngineOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(params.client_id.clone(), params.host.clone(), params.port);
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_start(params.clean_session);

    // Anonymous unless both halves of the credentials are present
    if let Some(credentials) = params.credentials() {
        mqtt_options.set_credentials(credentials.username, credentials.password);
    }

    mqtt_options
}

pub struct MqttEngine {
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    sink: EngineEventSink,
    reconnect: ReconnectConfig,
    shutdown_tx: watch::Sender<bool>,
    poll_handle: Option<JoinHandle<()>>,
    packet_ids: PacketIdSequence,
}

impl MqttEngine {
    pub fn new(params: &SessionParameters, options: &EngineOptions, sink: EngineEventSink) -> Self {
        let mqtt_options = configure_mqtt_options(params, options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            client,
            event_loop: Some(event_loop),
            sink,
            reconnect: options.reconnect.clone(),
            shutdown_tx,
            poll_handle: None,
            packet_ids: PacketIdSequence::default(),
        }
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        sink: EngineEventSink,
        reconnect: ReconnectConfig,
        inflight: InflightLimit,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let session = sink.session();
        info!(session_id = %session, "Starting MQTT event loop");
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        Self::drain(&mut event_loop).await;
                        break;
                    }
                }

                polled = event_loop.poll() => {
                    match polled {
                        Ok(event) => {
                            // Stored before the ack is emitted so requests made
                            // in reaction to it see the new limit
                            if let Event::Incoming(Packet::ConnAck(connack)) = &event {
                                inflight.apply_receive_maximum(
                                    connack.properties.as_ref().and_then(|p| p.receive_max),
                                );
                            }
                            if let Some(routed) = EventRouter::route_event(&event) {
                                if matches!(routed, EngineEvent::ConnectAck { accepted: true, .. }) {
                                    attempts = 0;
                                }
                                if !sink.emit(routed) {
                                    break;
                                }
                            }
                        }
                        Err(error) => {
                            warn!(session_id = %session, "MQTT event loop error: {}", error);
                            if !sink.emit(EventRouter::route_error(&error)) {
                                break;
                            }

                            attempts = attempts.saturating_add(1);
                            let delay_ms = reconnect.calculate_backoff_delay(attempts);
                            debug!(session_id = %session, attempt = attempts, delay_ms, "Waiting before reconnect");
                            if !Self::interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(session_id = %session, "MQTT event loop stopped");
    }

    /// Returns true if the sleep completed, false if shutdown was requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                changed.is_ok() && !*shutdown_rx.borrow()
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Wait for the polling task to finish its drain, aborting it if it overruns
    fn reap(handle: JoinHandle<()>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            handle.abort();
            return;
        };
        let abort = handle.abort_handle();
        runtime.spawn(async move {
            match tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(1), handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    abort.abort();
                }
                _ => {}
            }
        });
    }

    /// Keep polling briefly so a queued DISCONNECT reaches the broker
    async fn drain(event_loop: &mut EventLoop) {
        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("Event loop drain timed out");
        }
    }
}

impl ProtocolEngine for MqttEngine {
    fn connect(&mut self) -> Result<(), EngineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let event_loop = self.event_loop.take().ok_or(EngineError::AlreadyStarted)?;

        let span = crate::engine_span!(session_id = %self.sink.session());
        let handle = runtime.spawn(
            Self::run_event_loop(
                event_loop,
                self.sink.clone(),
                self.reconnect.clone(),
                self.packet_ids.limit().clone(),
                self.shutdown_tx.subscribe(),
            )
            .instrument(span),
        );
        self.poll_handle = Some(handle);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("DISCONNECT not queued: {}", e);
        }
        let _ = self.shutdown_tx.send(true);
        // Never started: nothing is polling, drop the loop outright
        self.event_loop = None;

        if let Some(handle) = self.poll_handle.take() {
            Self::reap(handle);
        }
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), EngineError> {
        self.client
            .try_subscribe(topic, EventRouter::to_wire_qos(qos))
            .map_err(|e| EngineError::Request(Box::new(e)))?;
        self.packet_ids.next_id();
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), EngineError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| EngineError::Request(Box::new(e)))?;
        self.packet_ids.next_id();
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, EngineError> {
        self.client
            .try_publish(topic, EventRouter::to_wire_qos(qos), retain, payload)
            .map_err(|e| EngineError::Request(Box::new(e)))?;
        // Same id rumqttc stamps on the packet; QoS 0 carries none
        if qos == QoS::AtMostOnce {
            return Ok(0);
        }
        Ok(self.packet_ids.next_id())
    }
}

impl Drop for MqttEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Factory producing rumqttc engines
#[derive(Debug, Clone, Default)]
pub struct MqttEngineFactory {
    options: EngineOptions,
}

impl MqttEngineFactory {
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }
}

impl EngineFactory for MqttEngineFactory {
    fn create(
        &self,
        params: &SessionParameters,
        sink: EngineEventSink,
    ) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        if params.host.trim().is_empty() {
            return Err(EngineError::Create("empty host name".to_string()));
        }
        // rumqttc refuses client ids that are empty or start with a space
        if params.client_id.is_empty() || params.client_id.starts_with(' ') {
            return Err(EngineError::Create(format!(
                "invalid client id '{}'",
                params.client_id
            )));
        }
        Ok(Box::new(MqttEngine::new(params, &self.options, sink)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use tokio::sync::mpsc;

    fn params() -> SessionParameters {
        SessionParameters::new("localhost", 1883, "test-client")
    }

    fn sink() -> EngineEventSink {
        let (tx, _rx) = mpsc::unbounded_channel();
        EngineEventSink::new(SessionId::new(1), tx)
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff_pattern, vec![500, 1000, 2000, 5000]);
        assert_eq!(config.sustained_delay, 5000);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(1), 500);
        assert_eq!(config.calculate_backoff_delay(4), 5000);
        assert_eq!(config.calculate_backoff_delay(100), 5000);

        let empty = ReconnectConfig {
            backoff_pattern: vec![],
            sustained_delay: 250,
        };
        assert_eq!(empty.calculate_backoff_delay(1), 250);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options(&params(), &EngineOptions::default());
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(options.client_id(), "test-client");
    }

    #[test]
    fn test_factory_rejects_empty_host() {
        let factory = MqttEngineFactory::default();
        let bad = SessionParameters::new("  ", 1883, "c");
        assert!(matches!(factory.create(&bad, sink()), Err(EngineError::Create(_))));

        let bad_id = SessionParameters::new("localhost", 1883, " padded");
        assert!(matches!(factory.create(&bad_id, sink()), Err(EngineError::Create(_))));
    }

    #[test]
    fn test_connect_without_runtime_fails() {
        let mut engine = MqttEngine::new(&params(), &EngineOptions::default(), sink());
        assert!(matches!(engine.connect(), Err(EngineError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let mut engine = MqttEngine::new(&params(), &EngineOptions::default(), sink());
        engine.connect().unwrap();
        assert!(matches!(engine.connect(), Err(EngineError::AlreadyStarted)));
        engine.disconnect();
    }

    #[tokio::test]
    async fn test_message_ids_follow_qos() {
        let mut engine = MqttEngine::new(&params(), &EngineOptions::default(), sink());
        let id0 = engine
            .publish("t", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
            .unwrap();
        let id1 = engine
            .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
            .unwrap();
        engine.subscribe("a", QoS::AtLeastOnce).unwrap();
        engine.unsubscribe("a").unwrap();
        let id2 = engine
            .publish("t", Bytes::from_static(b"x"), QoS::ExactlyOnce, false)
            .unwrap();

        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
        // SUBSCRIBE and UNSUBSCRIBE took ids 2 and 3
        assert_eq!(id2, 4);
    }

    #[test]
    fn test_message_id_wraps_at_receive_maximum() {
        let mut engine = MqttEngine::new(&params(), &EngineOptions::default(), sink());
        engine.packet_ids.limit().apply_receive_maximum(Some(2));

        let ids: Vec<_> = (0..3)
            .map(|_| {
                engine
                    .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
                    .unwrap()
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 1]);
    }
}
