//! Testing utilities and mock implementations
//!
//! Mock protocol engines that let the session core and connection manager be
//! exercised without an MQTT broker.

pub mod mocks;

pub use mocks::*;
