//! Common module for library exports

pub use crate::breakpoints::{BreakpointId, BreakpointKind, BreakpointResolution, DiagnosticSeverity};
pub use crate::config::SessionConfig;
pub use crate::error::{DebuggerError, Result};
pub use crate::events::{SessionEvent, SessionEventReceiver};
pub use crate::ide::IdePosition;
pub use crate::session::DebugSession;
pub use crate::symbols::{Resolver, SymbolDatabase};
pub use crate::types::{Address, Architecture, Registers, SourcePosition, StackFrame, StopReason, ThreadId};
