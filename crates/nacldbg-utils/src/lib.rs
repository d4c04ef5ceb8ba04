//! # nacldbg Utilities
//!
//! Logging setup shared by every nacldbg binary. Library crates only use the
//! `tracing` macros; installing a subscriber is left to whoever owns `main`.

pub mod logging;

pub use logging::{init_logging, init_logging_to_dir, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
