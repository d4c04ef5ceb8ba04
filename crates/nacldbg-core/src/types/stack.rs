//! Stack frame type.

use super::{Address, Function, Registers, SourcePosition};

/// One frame of an unwound call stack, innermost first.
#[derive(Debug, Clone)]
pub struct StackFrame
{
    /// 0 for the frame that is executing
    pub index: usize,
    /// Program counter of the frame
    pub pc: Address,
    /// Stack pointer of the frame
    pub sp: Address,
    /// Canonical frame address when call frame information covers the PC
    pub cfa: Option<Address>,
    /// Containing function, or the unknown sentinel
    pub function: Function,
    /// Source position of the PC (DWARF line numbering)
    pub position: Option<SourcePosition>,
    /// Full register snapshot recovered for this frame
    pub registers: Registers,
}

impl StackFrame
{
    /// Whether this is the executing frame.
    #[must_use]
    pub const fn is_innermost(&self) -> bool
    {
        self.index == 0
    }
}
