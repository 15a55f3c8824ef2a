//! Observability for the session core
//!
//! Structured logging through `tracing`, configured from the environment, plus
//! span macros for session and engine work.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LoggingConfig};

// Span macros for structured logging
pub use logging::{engine_span, session_span};
