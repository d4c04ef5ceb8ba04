//! GDB remote serial protocol client.
//!
//! [`GdbHost`] speaks individual commands over a packet connection;
//! [`RemoteSession`] builds the debugger's run control on top of it.

mod host;
mod session;

pub use host::{parse_stop_reply, GdbHost, StopEvent, MAX_MEMORY_CHUNK};
pub use session::{Handshake, RemoteSession, SessionState};
