//! # nacldbg-protocol
//!
//! Wire layer for talking to a GDB remote stub (the debug stub built into the
//! Native Client loader speaks this protocol).
//!
//! The crate knows nothing about registers, breakpoints or symbols. It frames
//! payloads as `$<payload>#<checksum>`, handles acknowledgements and
//! retransmission, and hands complete packets back to the caller.
//!
//! - [`packet`]: framing, escaping, run-length decoding and a streaming decoder
//! - [`hex`]: hex helpers shared by every packet type
//! - [`connection`]: a [`Connection`] over any [`Transport`] (TCP in practice)

pub mod connection;
pub mod error;
pub mod hex;
pub mod packet;

pub use connection::{Connection, Transport};
pub use error::{ProtocolError, ProtocolResult};
pub use packet::{Frame, PacketDecoder};
