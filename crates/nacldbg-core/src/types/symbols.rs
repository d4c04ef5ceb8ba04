//! Symbol and source position types returned by the resolver.
//!
//! None of these are stored in the symbol database; they are computed on
//! demand from debug information entries.

use std::fmt;
use std::path::{Path, PathBuf};

use super::Address;
use crate::symbols::EntryKey;

/// A source position with a DWARF (1-based) line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition
{
    /// Current absolute path of the file (see `SourceFile::current_path`)
    pub path: PathBuf,
    /// 1-based line
    pub line: u32,
    /// Column, 0 when unknown
    pub column: u32,
}

impl SourcePosition
{
    /// Whether both positions name the same line of the same file.
    ///
    /// Columns are ignored; stepping treats a line as the unit of progress.
    #[must_use]
    pub fn same_line(&self, other: &Self) -> bool
    {
        self.line == other.line && self.path == other.path
    }

    /// File component of the path, for display.
    #[must_use]
    pub fn file_name(&self) -> &str
    {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    /// Path accessor.
    #[must_use]
    pub fn path(&self) -> &Path
    {
        &self.path
    }
}

impl fmt::Display for SourcePosition
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}", self.path.display(), self.line)
    }
}

/// The function that contains an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function
{
    /// Entry of the `DW_TAG_subprogram`, `None` for the unknown function
    pub key: Option<EntryKey>,
    /// Display name
    pub name: String,
    /// Absolute `[low, high)` range when the subprogram has one
    pub range: Option<(Address, Address)>,
}

impl Function
{
    /// Name used when no subprogram covers an address.
    pub const UNKNOWN_NAME: &'static str = "<unknown function>";

    /// Sentinel for addresses outside every function.
    #[must_use]
    pub fn unknown() -> Self
    {
        Self {
            key: None,
            name: Self::UNKNOWN_NAME.to_string(),
            range: None,
        }
    }

    /// Whether this is the sentinel.
    #[must_use]
    pub const fn is_unknown(&self) -> bool
    {
        self.key.is_none()
    }

    /// Whether `address` lies in the function's range.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.range.is_some_and(|(low, high)| address >= low && address < high)
    }
}

impl fmt::Display for Function
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.name)
    }
}

/// Coarse classification of a resolved type chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeKind
{
    Pointer,
    Bool,
    Char,
    Int,
    UInt,
    Float,
    Struct,
    #[default]
    Unknown,
}

/// A type chain flattened into a display name, a kind and a size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolType
{
    /// First type entry referenced by the symbol, `None` when unresolved
    pub key: Option<EntryKey>,
    /// Display name such as `char const *`
    pub name: String,
    /// Byte size of the outermost sized component (`char *` is 8)
    pub size: u64,
    /// Kind decided by the outermost classifying component
    pub kind: TypeKind,
}

impl SymbolType
{
    /// The explicit unresolved result.
    #[must_use]
    pub fn unknown() -> Self
    {
        Self {
            key: None,
            name: "unknown".to_string(),
            size: 0,
            kind: TypeKind::Unknown,
        }
    }

    /// Whether the type chain resolved.
    #[must_use]
    pub fn is_known(&self) -> bool
    {
        self.key.is_some() && self.kind != TypeKind::Unknown
    }

    /// Render raw little-endian target bytes as a value of this type.
    ///
    /// Returns `None` when the kind is unknown, when fewer than `size` bytes
    /// were supplied, or when the size does not fit the kind.
    ///
    /// ```rust
    /// use nacldbg_core::types::{SymbolType, TypeKind};
    ///
    /// let int = SymbolType { key: None, name: "int".into(), size: 4, kind: TypeKind::Int };
    /// assert_eq!(int.format_value(&(-3i32).to_le_bytes()).as_deref(), Some("-3"));
    /// ```
    #[must_use]
    pub fn format_value(&self, bytes: &[u8]) -> Option<String>
    {
        let size = usize::try_from(self.size).ok()?;
        if self.kind == TypeKind::Unknown || bytes.len() < size {
            return None;
        }
        let bytes = &bytes[..size];

        match self.kind {
            TypeKind::Struct => Some(format!("{{{}}}", self.name)),
            TypeKind::Char => bytes.first().map(|byte| byte.to_string()),
            TypeKind::Bool => Some(if bytes.iter().any(|&byte| byte != 0) { "true" } else { "false" }.to_string()),
            TypeKind::Pointer => unsigned(bytes).map(|value| format!("0x{value:x}")),
            TypeKind::UInt => unsigned(bytes).map(|value| value.to_string()),
            TypeKind::Int => signed(bytes).map(|value| value.to_string()),
            TypeKind::Float => match size {
                4 => Some(f32::from_le_bytes(bytes.try_into().ok()?).to_string()),
                8 => Some(f64::from_le_bytes(bytes.try_into().ok()?).to_string()),
                _ => None,
            },
            TypeKind::Unknown => None,
        }
    }
}

impl fmt::Display for SymbolType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.name)
    }
}

fn unsigned(bytes: &[u8]) -> Option<u64>
{
    match bytes.len() {
        1 | 2 | 4 | 8 => {
            let mut buffer = [0u8; 8];
            buffer[..bytes.len()].copy_from_slice(bytes);
            Some(u64::from_le_bytes(buffer))
        }
        _ => None,
    }
}

fn signed(bytes: &[u8]) -> Option<i64>
{
    let value = unsigned(bytes)?;
    let shift = 64 - bytes.len() * 8;
    Some(((value << shift) as i64) >> shift)
}

/// Where a variable lives at the current PC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolLocation
{
    /// In target memory at this absolute address
    Memory(Address),
    /// In a register; reading register-resident variables is not supported
    Register(u16),
    /// Optimised into a constant (`DW_OP_stack_value`)
    Value(u64),
    /// Not computable here (no loclist entry for the PC, missing frame base, ...)
    Unavailable(String),
}

impl SymbolLocation
{
    /// Address when the variable is in memory.
    #[must_use]
    pub const fn address(&self) -> Option<Address>
    {
        match self {
            Self::Memory(address) => Some(*address),
            _ => None,
        }
    }
}

/// A named variable or parameter visible at some PC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol
{
    /// Entry of the variable
    pub key: EntryKey,
    /// Source name
    pub name: String,
    /// Location at the PC the symbol was collected for
    pub location: SymbolLocation,
    /// Resolved type
    pub symbol_type: SymbolType,
}
