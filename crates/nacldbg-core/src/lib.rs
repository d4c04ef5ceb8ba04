//! # nacldbg-core
//!
//! Symbolic debugging core for Native Client modules.
//!
//! This crate provides:
//! - A DWARF symbol database built once per module and queried read-only
//!   afterwards ([`symbols::SymbolDatabase`])
//! - Address/source mapping, scopes, variables and type names
//!   ([`symbols::Resolver`])
//! - Breakpoint placement with diagnostics ([`breakpoints::BreakpointLocator`])
//! - CFI-driven stack unwinding and a DWARF location expression interpreter
//!   ([`unwind`])
//! - Run control of a live target through a GDB remote stub
//!   ([`remote::RemoteSession`])
//! - An owned [`DebugSession`] tying the two halves together for an IDE
//!
//! ## Addresses
//!
//! The symbol database works with module-relative `u64` offsets. Everything
//! that talks to the target uses [`types::Address`]; the resolver converts
//! using the module base the stub reports at open time.
//!
//! ## Threads
//!
//! A session is driven from one control thread. The remote session runs one
//! background poller and serialises every operation with it through a single
//! mutex. Events are delivered over channels, never through callbacks, so a
//! listener may call back into the session freely.

pub mod breakpoints;
pub mod config;
pub mod error;
pub mod events;
pub mod ide;
pub mod prelude;
pub mod remote;
pub mod session;
pub mod symbols;
pub mod types;
pub mod unwind;

pub use config::SessionConfig;
// Re-export commonly used types
pub use error::{DebuggerError, Result};
pub use events::{EventBus, SessionEvent};
pub use session::{BreakpointBinding, DebugSession};
pub use types::{Address, Registers, ThreadId};
