//! Connection manager state machine tests
//!
//! The manager is driven through mock engines: tests play the broker by
//! applying engine events and assert on state, notifications and the calls
//! the engine received.

use bytes::Bytes;
use mqtt_session::engine::EngineEvent;
use mqtt_session::testing::{EngineCall, MockEngineFactory};
use mqtt_session::{
    ChangeCause, ConnectionManager, ConnectionState, QoS, SessionError, SessionParameters,
    SessionSettings, StateChange,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::time::timeout;

fn setup() -> (Arc<MockEngineFactory>, ConnectionManager, Receiver<StateChange>) {
    let factory = Arc::new(MockEngineFactory::new());
    let manager = ConnectionManager::new(factory.clone(), SessionSettings::default());
    let changes = manager.subscribe_changes();
    (factory, manager, changes)
}

fn params() -> SessionParameters {
    SessionParameters::new("broker.local", 1883, "test-client")
}

fn accepted() -> EngineEvent {
    EngineEvent::ConnectAck {
        accepted: true,
        reason_code: 0,
    }
}

fn drain(changes: &mut Receiver<StateChange>) -> Vec<StateChange> {
    let mut collected = Vec::new();
    while let Ok(change) = changes.try_recv() {
        collected.push(change);
    }
    collected
}

async fn next_change(changes: &mut Receiver<StateChange>) -> StateChange {
    timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("notification should arrive")
        .expect("notification stream should be open")
}

#[tokio::test]
async fn test_start_connect_while_connecting_is_rejected() {
    let (factory, manager, mut changes) = setup();

    manager.start_connect(params()).unwrap();
    drain(&mut changes);

    let result = manager.start_connect(params());

    assert!(matches!(result, Err(SessionError::AlreadyConnecting)));
    assert_eq!(factory.created_count(), 1, "no new session should be created");
    assert!(drain(&mut changes).is_empty(), "no notification should be emitted");
    assert_eq!(manager.state(), ConnectionState::Connecting);
}

#[tokio::test]
async fn test_start_connect_while_connected_is_rejected() {
    let (factory, manager, _changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(id, accepted());

    assert!(matches!(
        manager.start_connect(params()),
        Err(SessionError::AlreadyConnected)
    ));
    assert_eq!(factory.created_count(), 1);
    assert_eq!(manager.current_session(), Some(id));
}

#[tokio::test]
async fn test_engine_create_failure_leaves_state_untouched() {
    let (factory, manager, mut changes) = setup();
    factory.fail_create(true);

    let result = manager.start_connect(params());

    assert!(matches!(result, Err(SessionError::EngineCreateFailed(_))));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current_session().is_none());
    assert!(drain(&mut changes).is_empty());
}

#[tokio::test]
async fn test_engine_connect_failure_reports_and_recovers() {
    let (factory, manager, mut changes) = setup();
    factory.fail_connect(true);

    let result = manager.start_connect(params());

    assert!(matches!(result, Err(SessionError::Engine(_))));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    let causes: Vec<_> = drain(&mut changes).into_iter().map(|c| c.cause).collect();
    assert_eq!(causes, vec![ChangeCause::ConnectRequested, ChangeCause::ConnectFailed]);

    factory.fail_connect(false);
    assert!(manager.start_connect(params()).is_ok());
}

#[tokio::test]
async fn test_cancel_while_connecting() {
    let (factory, manager, mut changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    manager.cancel_or_disconnect();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current_session().is_none());

    let changes = drain(&mut changes);
    assert_eq!(changes.last().map(|c| c.cause.clone()), Some(ChangeCause::Cancelled));

    let engine = factory.for_session(id).unwrap().engine;
    assert_eq!(engine.calls(), vec![EngineCall::Connect, EngineCall::Disconnect]);
}

#[tokio::test]
async fn test_cancel_when_disconnected_is_a_no_op() {
    let (_factory, manager, mut changes) = setup();

    manager.cancel_or_disconnect();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(drain(&mut changes).is_empty());
}

#[tokio::test]
async fn test_refused_connect_tears_session_down() {
    let (factory, manager, mut changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(
        id,
        EngineEvent::ConnectAck {
            accepted: false,
            reason_code: 5,
        },
    );

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current_session().is_none());

    let last = drain(&mut changes).pop().unwrap();
    assert_eq!(last.cause, ChangeCause::Refused { code: 5 });
    assert!(matches!(
        last.error(),
        Some(SessionError::ConnectRefused { code: 5, .. })
    ));
    assert!(factory
        .for_session(id)
        .unwrap()
        .engine
        .calls()
        .contains(&EngineCall::Disconnect));
}

#[tokio::test]
async fn test_events_flow_through_reducer() {
    let (factory, manager, mut changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    assert_eq!(next_change(&mut changes).await.state, ConnectionState::Connecting);

    let created = factory.for_session(id).unwrap();
    created.accept();

    let change = next_change(&mut changes).await;
    assert_eq!(change.state, ConnectionState::Connected);
    assert_eq!(change.previous, ConnectionState::Connecting);
    assert_eq!(change.session, id);
}

#[tokio::test]
async fn test_message_signal_and_buffer() {
    let (factory, manager, _changes) = setup();
    let mut signal = manager.message_signal();

    let id = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(id, accepted());

    let created = factory.for_session(id).unwrap();
    created.deliver("sensors/a", b"21.5", 1);
    created.deliver("sensors/b", b"19.0", 2);

    timeout(Duration::from_secs(2), async {
        while manager.messages().len() < 2 {
            signal.changed().await.unwrap();
        }
    })
    .await
    .expect("messages should arrive");

    let messages = manager.messages();
    assert_eq!(messages[0].topic, "sensors/b");
    assert_eq!(messages[1].text.as_deref(), Some("21.5"));
    assert_eq!(manager.messages_for_topic("sensors/a").len(), 1);
    assert!(manager.take_new_message());
    assert!(!manager.take_new_message());

    manager.clear_messages();
    assert!(manager.messages().is_empty());
    assert_eq!(manager.stats().unwrap().messages_received, 2);
}

#[tokio::test]
async fn test_operations_without_session() {
    let (_factory, manager, _changes) = setup();

    assert!(matches!(
        manager.subscribe("a/b", QoS::AtMostOnce),
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(manager.unsubscribe(), Err(SessionError::NotConnected)));
    assert!(matches!(
        manager.publish("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce, false),
        Err(SessionError::NotConnected)
    ));
    assert!(manager.messages().is_empty());
    assert!(manager.stats().is_none());
    assert!(manager.subscription().is_none());
    assert!(!manager.take_new_message());
}

#[tokio::test]
async fn test_publish_counts_on_acknowledgment() {
    let (factory, manager, _changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(id, accepted());

    let message_id = manager
        .publish("cmd/light", "on", QoS::AtLeastOnce, true)
        .unwrap();
    assert_eq!(manager.stats().unwrap().messages_sent, 0);

    manager.apply_engine_event(id, EngineEvent::PublishAck { message_id });
    assert_eq!(manager.stats().unwrap().messages_sent, 1);

    let published = factory.for_session(id).unwrap().engine.published();
    assert_eq!(
        published,
        vec![EngineCall::Publish {
            topic: "cmd/light".into(),
            payload: Bytes::from_static(b"on"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }]
    );
}

#[tokio::test]
async fn test_lost_connection_keeps_session_for_retry() {
    let factory = Arc::new(MockEngineFactory::new());
    let manager = ConnectionManager::new(factory.clone(), SessionSettings::default());
    let mut changes = manager.subscribe_changes();

    let params = params().with_clean_session(false);
    let id = manager.start_connect(params).unwrap();
    manager.apply_engine_event(id, accepted());
    manager.subscribe("alerts/#", QoS::AtLeastOnce).unwrap();
    drain(&mut changes);

    manager.apply_engine_event(
        id,
        EngineEvent::Disconnected {
            error: Some("Connection reset by peer".into()),
        },
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.current_session(), Some(id));
    let lost = drain(&mut changes);
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].cause, ChangeCause::ConnectionLost);

    // Engine retries on its own and the broker accepts again
    let engine = factory.for_session(id).unwrap().engine;
    engine.clear_calls();
    manager.apply_engine_event(id, accepted());

    assert_eq!(manager.state(), ConnectionState::Connected);
    let states: Vec<_> = drain(&mut changes).into_iter().map(|c| c.state).collect();
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);
    assert_eq!(
        engine.calls(),
        vec![EngineCall::Subscribe {
            topic: "alerts/#".into(),
            qos: QoS::AtLeastOnce
        }]
    );
}

#[tokio::test]
async fn test_dormant_session_rejects_requests() {
    let (factory, manager, _changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(id, accepted());
    manager.apply_engine_event(
        id,
        EngineEvent::Disconnected {
            error: Some("keep alive timeout".into()),
        },
    );
    assert_eq!(manager.current_session(), Some(id));

    let engine = factory.for_session(id).unwrap().engine;
    engine.clear_calls();

    assert!(matches!(
        manager.publish("cmd/light", "on", QoS::AtLeastOnce, false),
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        manager.subscribe("alerts/#", QoS::AtMostOnce),
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(manager.unsubscribe(), Err(SessionError::NotConnected)));
    assert!(engine.calls().is_empty());

    manager.apply_engine_event(id, accepted());
    assert!(manager.publish("cmd/light", "on", QoS::AtMostOnce, false).is_ok());
}

#[tokio::test]
async fn test_refused_retry_of_dormant_session_notifies() {
    let (_factory, manager, mut changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(id, accepted());
    manager.apply_engine_event(
        id,
        EngineEvent::Disconnected {
            error: Some("broker restarting".into()),
        },
    );
    drain(&mut changes);

    manager.apply_engine_event(
        id,
        EngineEvent::ConnectAck {
            accepted: false,
            reason_code: 0x87,
        },
    );

    assert!(manager.current_session().is_none());
    let changes = drain(&mut changes);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].previous, ConnectionState::Disconnected);
    assert_eq!(changes[0].state, ConnectionState::Disconnected);
    assert_eq!(changes[0].cause, ChangeCause::Refused { code: 0x87 });
}

#[tokio::test]
async fn test_publish_id_follows_subscription_packets() {
    let (factory, manager, _changes) = setup();

    let id = manager
        .start_connect(params().with_clean_session(false))
        .unwrap();
    manager.apply_engine_event(id, accepted());

    // SUBSCRIBE takes packet id 1
    manager.subscribe("alerts/#", QoS::AtLeastOnce).unwrap();
    let first = manager.publish("cmd/light", "on", QoS::AtLeastOnce, false).unwrap();
    assert_eq!(first, 2);

    // Reconnect resubscribes, which takes id 3
    manager.apply_engine_event(
        id,
        EngineEvent::Disconnected {
            error: Some("reset".into()),
        },
    );
    manager.apply_engine_event(id, accepted());
    let second = manager.publish("cmd/light", "off", QoS::ExactlyOnce, false).unwrap();
    assert_eq!(second, 4);

    let engine = factory.for_session(id).unwrap().engine;
    assert_eq!(
        engine.count(&EngineCall::Subscribe {
            topic: "alerts/#".into(),
            qos: QoS::AtLeastOnce
        }),
        2
    );

    manager.apply_engine_event(id, EngineEvent::PublishAck { message_id: second });
    assert_eq!(manager.stats().unwrap().messages_sent, 1);
}

#[tokio::test]
async fn test_clean_disconnect_releases_session() {
    let (_factory, manager, mut changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(id, accepted());
    drain(&mut changes);

    manager.apply_engine_event(id, EngineEvent::Disconnected { error: None });

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current_session().is_none());
    let last = drain(&mut changes).pop().unwrap();
    assert_eq!(last.cause, ChangeCause::ClosedCleanly);
    assert!(last.error().is_none());
}

#[tokio::test]
async fn test_new_connect_replaces_dormant_session_silently() {
    let (factory, manager, mut changes) = setup();

    let first = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(first, accepted());
    manager.apply_engine_event(
        first,
        EngineEvent::Disconnected {
            error: Some("timeout".into()),
        },
    );
    drain(&mut changes);

    let second = manager.start_connect(params()).unwrap();

    let states: Vec<_> = drain(&mut changes).into_iter().map(|c| c.state).collect();
    assert_eq!(states, vec![ConnectionState::Connecting]);
    assert!(factory
        .for_session(first)
        .unwrap()
        .engine
        .calls()
        .contains(&EngineCall::Disconnect));

    // The old engine's late callbacks are ignored
    manager.apply_engine_event(first, accepted());
    assert_eq!(manager.state(), ConnectionState::Connecting);
    assert_eq!(manager.current_session(), Some(second));
}

#[tokio::test]
async fn test_user_disconnect_from_connected() {
    let (_factory, manager, mut changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    manager.apply_engine_event(id, accepted());
    manager.cancel_or_disconnect();

    let last = drain(&mut changes).pop().unwrap();
    assert_eq!(last.cause, ChangeCause::UserDisconnect);
    assert_eq!(last.previous, ConnectionState::Connected);

    // Second call: nothing left to do
    manager.cancel_or_disconnect();
    assert!(drain(&mut changes).is_empty());
}

#[tokio::test]
async fn test_stats_snapshot() {
    let (_factory, manager, _changes) = setup();

    let id = manager.start_connect(params()).unwrap();
    let before = manager.stats().unwrap();
    assert!(before.connected_at.is_none());

    manager.apply_engine_event(id, accepted());
    manager.subscribe("t/1", QoS::ExactlyOnce).unwrap();

    let stats = manager.stats().unwrap();
    assert_eq!(stats.session_id, id);
    assert_eq!(stats.host, "broker.local");
    assert_eq!(stats.client_id, "test-client");
    assert!(stats.connected_at.is_some());
    assert_eq!(stats.subscription.unwrap().topic, "t/1");
    assert_eq!(manager.subscription().unwrap().qos, QoS::ExactlyOnce);
}
