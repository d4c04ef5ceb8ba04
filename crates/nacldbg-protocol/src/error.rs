//! # Protocol Errors
//!
//! Failures that can happen below the level of debugger semantics: the socket
//! broke, the stub did not answer in time, or a packet arrived damaged.

use std::io;

use thiserror::Error;

/// Error type for packet transport.
#[derive(Error, Debug)]
pub enum ProtocolError
{
    /// The underlying transport failed (connection refused, reset, ...)
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// No complete reply arrived before the deadline
    ///
    /// The string names what was being waited for ("acknowledgement",
    /// "reply", ...).
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// A packet arrived whose trailing checksum does not match its body
    #[error("Packet checksum mismatch: expected 0x{expected:02x}, computed 0x{actual:02x}")]
    Checksum
    {
        /// Checksum sent by the peer
        expected: u8,
        /// Checksum computed over the received body
        actual: u8,
    },

    /// A reply could not be parsed
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// The stub closed the connection
    #[error("Connection closed by remote stub")]
    Disconnected,

    /// The stub answered with an `Exx` error reply
    #[error("Remote stub reported error E{0:02x}")]
    Remote(u8),

    /// The stub kept rejecting a packet with `-`
    #[error("Packet rejected {0} times by remote stub")]
    Nack(u32),
}

/// Convenience alias for protocol results.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
