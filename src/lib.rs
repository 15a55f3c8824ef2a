//! MQTT session core
//!
//! Client-side management of a single MQTT broker connection: connection
//! lifecycle with an explicit state machine, one tracked subscription, a
//! bounded newest-first buffer of received messages, publish with QoS and
//! retain, and a throttle that forcibly closes a session caught in a reconnect
//! storm.
//!
//! # Overview
//!
//! - [`ConnectionManager`] owns connection state and at most one [`Session`].
//!   Consumers call [`ConnectionManager::start_connect`] and
//!   [`ConnectionManager::cancel_or_disconnect`] and observe transitions on a
//!   broadcast stream.
//! - A [`Session`] drives one [`engine::ProtocolEngine`]; the rumqttc-backed
//!   [`engine::MqttEngine`] is the production implementation.
//! - [`settings`] keeps connection and subscription history, [`config`] loads
//!   the process configuration.
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_session::testing::MockEngineFactory;
//! use mqtt_session::{ConnectionManager, ConnectionState, SessionParameters, SessionSettings};
//! use std::sync::Arc;
//!
//! tokio_test::block_on(async {
//!     let factory = Arc::new(MockEngineFactory::new());
//!     let manager = ConnectionManager::new(factory.clone(), SessionSettings::default());
//!
//!     let params = SessionParameters::new("localhost", 1883, "quick-start");
//!     let session = manager.start_connect(params).unwrap();
//!     assert_eq!(manager.state(), ConnectionState::Connecting);
//!
//!     // Play the broker: accept the connection
//!     factory.for_session(session).unwrap().accept();
//!     while manager.state() != ConnectionState::Connected {
//!         tokio::task::yield_now().await;
//!     }
//!     assert_eq!(manager.state(), ConnectionState::Connected);
//!
//!     manager.cancel_or_disconnect();
//!     assert_eq!(manager.state(), ConnectionState::Disconnected);
//! });
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod observability;
pub mod session;
pub mod settings;
pub mod testing;

pub use config::{ClientConfig, ConfigError};
pub use error::{SessionError, SessionResult};
pub use manager::{ChangeCause, ConnectionManager, ConnectionState, StateChange};
pub use session::{
    format_uptime, MessageRecord, QoS, Session, SessionId, SessionParameters, SessionSettings,
    SessionStats, Subscription,
};
