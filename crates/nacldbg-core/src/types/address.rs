//! Target address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Absolute address in the debuggee's address space
///
/// Debug information describes a module as if it were loaded at zero; the
/// sandbox maps it at a base address chosen at runtime. Values read from the
/// symbol database are plain `u64` module-relative offsets, while everything
/// that touches the live target (registers, memory, breakpoints) uses
/// `Address`. Converting between the two always goes through the module
/// base, which keeps the two spaces from being mixed by accident.
///
/// ## Example
///
/// ```rust
/// use nacldbg_core::types::Address;
///
/// let base = Address::new(0x0000_7f00_0000_0000);
/// let pc = base + 0x20080;
/// assert_eq!(pc.relative_to(base), Some(0x20080));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address. The unwinder treats a zero return address as the
    /// outermost frame.
    pub const ZERO: Self = Self(0);

    /// Create a new address; usable in const contexts.
    #[must_use]
    pub const fn new(value: u64) -> Self
    {
        Self(value)
    }

    /// Raw `u64` value.
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Module-relative offset of this address given the module `base`.
    ///
    /// Returns `None` for addresses below the base.
    ///
    /// ```rust
    /// use nacldbg_core::types::Address;
    ///
    /// assert_eq!(Address::new(0x10).relative_to(Address::new(0x20)), None);
    /// ```
    #[must_use]
    pub fn relative_to(self, base: Self) -> Option<u64>
    {
        self.0.checked_sub(base.0)
    }

    /// Add an offset, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Self)
    }

    /// Subtract an offset, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Self)
    }

    /// Add a signed displacement (CFA offsets, `DW_OP_breg` operands).
    #[must_use]
    pub const fn offset(self, displacement: i64) -> Self
    {
        Self(self.0.wrapping_add_signed(displacement))
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output
    {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Self(self.0.wrapping_sub(rhs))
    }
}
