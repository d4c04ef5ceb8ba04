//! # Error Types
//!
//! General error handling for the debugger core.
//!
//! We use `thiserror` to generate the `Error` implementations. Lookups that
//! can legitimately find nothing (an address outside every line-table row, a
//! file that was never compiled in) return `Option` instead of an error.

use nacldbg_protocol::ProtocolError;
use thiserror::Error;

use crate::types::Address;

/// Main error type for debugger operations
///
/// ## Error Categories
///
/// 1. **Input errors**: MalformedDwarf, CorruptDatabase, MalformedExpression
/// 2. **Remote errors**: Protocol, Timeout, NotConnected
/// 3. **State errors**: InvalidState
/// 4. **Target access errors**: MemoryAccess, RegisterAccess, NoBreakpoint
/// 5. **Capability errors**: Unsupported
/// 6. **I/O errors**: Io (for reading modules from disk)
#[derive(Error, Debug)]
pub enum DebuggerError
{
    /// The module's debug information could not be parsed
    ///
    /// Raised while walking `.debug_info`, `.debug_line`, location/range
    /// lists or call frame information. The string carries the section and
    /// the underlying parser error.
    #[error("Malformed DWARF: {0}")]
    MalformedDwarf(String),

    /// The symbol database references data that does not exist
    ///
    /// Index construction rejects databases with dangling references, for
    /// example a scope transition naming an entry that was never added.
    #[error("Corrupt symbol database: {0}")]
    CorruptDatabase(String),

    /// A location expression could not be evaluated
    ///
    /// Stack underflow, truncated operands and division by zero all land
    /// here.
    #[error("Malformed location expression: {0}")]
    MalformedExpression(String),

    /// The remote stub connection failed at the packet level
    #[error("Remote protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The remote stub did not answer in time
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The session is not in the state the operation needs
    ///
    /// For example calling `open` on a session that is already open, or
    /// reading registers while the target is running.
    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState
    {
        /// State the operation requires
        expected: String,
        /// State the session was in
        actual: String,
    },

    /// Operation needs an open remote session
    #[error("Not connected to a remote stub")]
    NotConnected,

    /// Target memory could not be read or written
    #[error("Memory access failed at {address} ({length} bytes): {reason}")]
    MemoryAccess
    {
        /// First address of the access
        address: Address,
        /// Number of bytes requested
        length: usize,
        /// Stub error or short reply description
        reason: String,
    },

    /// Target registers could not be read or written
    #[error("Register access failed: {0}")]
    RegisterAccess(String),

    /// No breakpoint is installed at the given address
    #[error("No breakpoint at address 0x{0:x}")]
    NoBreakpoint(u64),

    /// The debug information uses a feature this debugger does not implement
    ///
    /// Call frame rules expressed as DWARF expressions and variables that live
    /// in registers both end up here rather than producing wrong values.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Invalid argument passed to a debugger function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error (reading a module from disk, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebuggerError
{
    /// Build an [`DebuggerError::InvalidState`] from anything displayable.
    pub fn invalid_state(expected: impl ToString, actual: impl ToString) -> Self
    {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Convenience alias for debugger results.
pub type Result<T> = std::result::Result<T, DebuggerError>;

/// Wrap a `gimli` parse failure with the section or step that produced it.
pub(crate) fn map_dwarf_error(context: &str, err: gimli::Error) -> DebuggerError
{
    DebuggerError::MalformedDwarf(format!("{context}: {err}"))
}
