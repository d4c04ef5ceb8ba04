//! Debug information entries.
//!
//! Entries live in a flat arena inside the symbol database. Parent and
//! outer-scope links are [`EntryKey`]s, never references, so the tree can be
//! navigated in both directions without ownership cycles.

use std::fmt;

use gimli::{constants, DwAt, DwTag};
use smallvec::SmallVec;

/// Globally unique entry key.
///
/// DIE offsets are only unique within a compilation unit, so the unit's
/// index is folded into the upper half: `(unit_index << 32) | unit_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey(u64);

impl EntryKey
{
    /// Wrap a raw key.
    #[must_use]
    pub const fn new(raw: u64) -> Self
    {
        Self(raw)
    }

    /// Key for the entry at `offset` inside compilation unit `unit_index`.
    #[must_use]
    pub const fn from_parts(unit_index: u32, offset: u32) -> Self
    {
        Self(((unit_index as u64) << 32) | offset as u64)
    }

    /// Raw value.
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for EntryKey
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "<{:x}>", self.0)
    }
}

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue
{
    /// Addresses, sizes, encodings, line numbers
    Unsigned(u64),
    /// Signed constants
    Signed(i64),
    /// Names and paths
    String(String),
    /// Location expressions and other blocks
    Bytes(Vec<u8>),
    /// Reference to another entry (types, abstract origins, ...)
    Reference(EntryKey),
    /// Offset of a location list
    LocationList(u64),
    /// `DW_FORM_flag` / `DW_FORM_flag_present`
    Flag(bool),
}

impl AttributeValue
{
    /// Unsigned view; signed constants that are non-negative convert too.
    #[must_use]
    pub fn as_unsigned(&self) -> Option<u64>
    {
        match *self {
            Self::Unsigned(value) => Some(value),
            Self::Signed(value) => u64::try_from(value).ok(),
            _ => None,
        }
    }

    /// Signed view.
    #[must_use]
    pub fn as_signed(&self) -> Option<i64>
    {
        match *self {
            Self::Signed(value) => Some(value),
            Self::Unsigned(value) => i64::try_from(value).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str>
    {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]>
    {
        match self {
            Self::Bytes(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_reference(&self) -> Option<EntryKey>
    {
        match *self {
            Self::Reference(key) => Some(key),
            _ => None,
        }
    }
}

/// Attribute storage; most entries carry only a handful.
pub type Attributes = SmallVec<[(DwAt, AttributeValue); 6]>;

/// One node of the debug information tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfoEntry
{
    /// Unique key
    pub key: EntryKey,
    /// Parent entry, `None` for compilation unit roots
    pub parent: Option<EntryKey>,
    /// `DW_TAG_*`
    pub tag: DwTag,
    /// Nearest enclosing entry that defines a lexical scope
    pub outer_scope: Option<EntryKey>,
    attributes: Attributes,
}

impl DebugInfoEntry
{
    /// Entry without attributes.
    #[must_use]
    pub fn new(key: EntryKey, parent: Option<EntryKey>, tag: DwTag) -> Self
    {
        Self {
            key,
            parent,
            tag,
            outer_scope: None,
            attributes: Attributes::new(),
        }
    }

    /// Builder-style outer scope.
    #[must_use]
    pub const fn with_outer_scope(mut self, outer_scope: Option<EntryKey>) -> Self
    {
        self.outer_scope = outer_scope;
        self
    }

    /// Builder-style attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: DwAt, value: AttributeValue) -> Self
    {
        self.set_attribute(name, value);
        self
    }

    /// Insert or replace an attribute.
    pub fn set_attribute(&mut self, name: DwAt, value: AttributeValue)
    {
        if let Some(slot) = self.attributes.iter_mut().find(|(existing, _)| *existing == name) {
            slot.1 = value;
        } else {
            self.attributes.push((name, value));
        }
    }

    #[must_use]
    pub fn attribute(&self, name: DwAt) -> Option<&AttributeValue>
    {
        self.attributes
            .iter()
            .find(|(existing, _)| *existing == name)
            .map(|(_, value)| value)
    }

    #[must_use]
    pub fn has_attribute(&self, name: DwAt) -> bool
    {
        self.attribute(name).is_some()
    }

    /// Every attribute in insertion order.
    pub fn attributes(&self) -> impl Iterator<Item = &(DwAt, AttributeValue)>
    {
        self.attributes.iter()
    }

    /// `DW_AT_name`.
    #[must_use]
    pub fn name(&self) -> Option<&str>
    {
        self.attribute(constants::DW_AT_name).and_then(AttributeValue::as_str)
    }

    /// `DW_AT_low_pc`.
    #[must_use]
    pub fn low_pc(&self) -> Option<u64>
    {
        self.attribute(constants::DW_AT_low_pc).and_then(AttributeValue::as_unsigned)
    }

    /// `DW_AT_high_pc`, already normalised to an address by the loader.
    #[must_use]
    pub fn high_pc(&self) -> Option<u64>
    {
        self.attribute(constants::DW_AT_high_pc).and_then(AttributeValue::as_unsigned)
    }

    /// `DW_AT_type`.
    #[must_use]
    pub fn type_ref(&self) -> Option<EntryKey>
    {
        self.attribute(constants::DW_AT_type).and_then(AttributeValue::as_reference)
    }

    /// `DW_AT_byte_size`.
    #[must_use]
    pub fn byte_size(&self) -> Option<u64>
    {
        self.attribute(constants::DW_AT_byte_size).and_then(AttributeValue::as_unsigned)
    }

    /// Whether this entry opens a lexical scope of its own.
    #[must_use]
    pub fn is_scope(&self) -> bool
    {
        is_scope_tag(self.tag)
    }

    /// Whether this entry is a nested block (lexical, try or catch).
    #[must_use]
    pub fn is_block(&self) -> bool
    {
        matches!(
            self.tag,
            constants::DW_TAG_lexical_block | constants::DW_TAG_try_block | constants::DW_TAG_catch_block
        )
    }
}

/// Tags whose entries open a lexical scope.
#[must_use]
pub fn is_scope_tag(tag: DwTag) -> bool
{
    matches!(
        tag,
        constants::DW_TAG_compile_unit
            | constants::DW_TAG_subprogram
            | constants::DW_TAG_inlined_subroutine
            | constants::DW_TAG_lexical_block
            | constants::DW_TAG_try_block
            | constants::DW_TAG_catch_block
    )
}
