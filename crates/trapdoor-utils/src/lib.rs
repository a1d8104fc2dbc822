//! # Trapdoor Utilities
//!
//! Shared helpers for the host-side Trapdoor crates.
//!
//! The debugger core is `no_std` and only emits `tracing` events; this crate
//! installs the subscriber that turns them into console and file output when
//! the core runs in the simulator.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
