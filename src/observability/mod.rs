//! Observability helpers
//!
//! Logging setup for the `agentlink` binary and any application embedding
//! the library.

pub mod logging;

pub use logging::{connection_span, init_default_logging, init_logging, parse_level, LogFormat};
