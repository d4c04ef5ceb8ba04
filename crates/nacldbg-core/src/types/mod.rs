//! # Types
//!
//! Value types shared by the symbol, unwind and remote layers.

pub mod address;
pub mod process;
pub mod registers;
pub mod stack;
pub mod symbols;

// Re-export all public types
pub use address::Address;
pub use process::{Architecture, StopReason, ThreadId};
pub use registers::Registers;
pub use stack::StackFrame;
pub use symbols::{Function, SourcePosition, Symbol, SymbolLocation, SymbolType, TypeKind};
