//! Line numbering at the IDE boundary.
//!
//! DWARF numbers lines from 1, the IDE from 0. Everything inside the crate
//! works with DWARF lines; conversion happens only where a value crosses
//! into or out of [`crate::DebugSession`].

use std::fmt;
use std::path::PathBuf;

use crate::types::{SourcePosition, StackFrame};

/// DWARF line for a 0-based IDE line.
#[must_use]
pub const fn dwarf_line(ide_line: u32) -> u32
{
    ide_line.saturating_add(1)
}

/// 0-based IDE line for a DWARF line.
#[must_use]
pub const fn ide_line(dwarf_line: u32) -> u32
{
    dwarf_line.saturating_sub(1)
}

/// A source position with a 0-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdePosition
{
    pub path: PathBuf,
    /// 0-based line
    pub line: u32,
    pub column: u32,
}

impl IdePosition
{
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, line: u32) -> Self
    {
        Self {
            path: path.into(),
            line,
            column: 0,
        }
    }

    /// Back to DWARF numbering.
    #[must_use]
    pub fn to_source_position(&self) -> SourcePosition
    {
        SourcePosition {
            path: self.path.clone(),
            line: dwarf_line(self.line),
            column: self.column,
        }
    }
}

impl From<SourcePosition> for IdePosition
{
    fn from(position: SourcePosition) -> Self
    {
        Self {
            path: position.path,
            line: ide_line(position.line),
            column: position.column,
        }
    }
}

impl From<&SourcePosition> for IdePosition
{
    fn from(position: &SourcePosition) -> Self
    {
        Self::from(position.clone())
    }
}

impl fmt::Display for IdePosition
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}", self.path.display(), self.line)
    }
}

impl StackFrame
{
    /// Frame position in IDE numbering.
    #[must_use]
    pub fn ide_position(&self) -> Option<IdePosition>
    {
        self.position.as_ref().map(IdePosition::from)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_line_conversion()
    {
        assert_eq!(dwarf_line(0), 1);
        assert_eq!(ide_line(1), 0);
        assert_eq!(ide_line(0), 0);

        let position = SourcePosition {
            path: PathBuf::from("/src/hello.c"),
            line: 12,
            column: 3,
        };
        let ide = IdePosition::from(&position);
        assert_eq!(ide.line, 11);
        assert_eq!(ide.to_source_position(), position);
        assert_eq!(ide.to_string(), "/src/hello.c:11");
    }
}
