//! Delivery guarantee levels shared by the session core and the engine boundary

use serde::{Deserialize, Serialize};
use std::fmt;

/// MQTT quality-of-service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum QoS {
    /// At most once (0)
    #[default]
    AtMostOnce,
    /// At least once (1)
    AtLeastOnce,
    /// Exactly once (2)
    ExactlyOnce,
}

impl QoS {
    /// Map an integer level to a QoS. Unrecognized levels fall back to QoS 0.
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl From<u8> for QoS {
    fn from(level: u8) -> Self {
        QoS::from_level(level)
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.level()
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS {}", self.level())
    }
}
