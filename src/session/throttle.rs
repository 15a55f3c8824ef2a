//! Sliding-window reconnect storm detection
//!
//! Counts disconnects inside a fixed window that starts at the first disconnect.
//! Once the count passes the ceiling the session gives up on the engine's
//! automatic retries and tears the connection down.

use std::time::{Duration, Instant};

/// Default number of disconnects tolerated inside one window
pub const DEFAULT_STORM_CEILING: u32 = 10;

/// Default window length
pub const DEFAULT_STORM_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of recording one disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleVerdict {
    /// Still within tolerance
    Calm,
    /// The ceiling was just exceeded
    Storm,
}

#[derive(Debug, Clone)]
pub struct ReconnectThrottle {
    window_start: Option<Instant>,
    count: u32,
    ceiling: u32,
    window: Duration,
}

impl ReconnectThrottle {
    pub fn new(ceiling: u32, window: Duration) -> Self {
        Self {
            window_start: None,
            count: 0,
            ceiling,
            window,
        }
    }

    /// Record a disconnect observed at `now`.
    ///
    /// Returns [`ThrottleVerdict::Storm`] only on the call where the count first
    /// exceeds the ceiling inside the current window.
    pub fn record_disconnect(&mut self, now: Instant) -> ThrottleVerdict {
        let window_start = match self.window_start {
            Some(start) if now.saturating_duration_since(start) < self.window => start,
            _ => {
                self.window_start = Some(now);
                self.count = 1;
                return ThrottleVerdict::Calm;
            }
        };

        self.count = self.count.saturating_add(1);
        tracing::debug!(
            count = self.count,
            ceiling = self.ceiling,
            window_age_ms = now.saturating_duration_since(window_start).as_millis() as u64,
            "Disconnect recorded"
        );

        if self.count == self.ceiling.saturating_add(1) {
            ThrottleVerdict::Storm
        } else {
            ThrottleVerdict::Calm
        }
    }

    /// Forget the current window, e.g. after a successful connect
    pub fn reset(&mut self) {
        self.window_start = None;
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn window_start(&self) -> Option<Instant> {
        self.window_start
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }
}

impl Default for ReconnectThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_STORM_CEILING, DEFAULT_STORM_WINDOW)
    }
}
