//! Symbol demangling utilities.
//!
//! Functions without a `DW_AT_name` are shown by their demangled
//! `DW_AT_linkage_name`. Rust symbols (`_R...` and legacy `_ZN...E`) go
//! through `rustc_demangle`; anything else is shown as written.

use rustc_demangle::try_demangle;

/// Human-readable form of a linkage name.
///
/// The trailing hash of legacy Rust symbols is dropped.
///
/// ```rust
/// use nacldbg_core::symbols::demangle_name;
///
/// assert_eq!(demangle_name("_ZN4core3fmt5write17h0123456789abcdefE"), "core::fmt::write");
/// assert_eq!(demangle_name("main"), "main");
/// ```
#[must_use]
pub fn demangle_name(raw: &str) -> String
{
    match try_demangle(raw) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_plain_c_names_pass_through()
    {
        assert_eq!(demangle_name("NaClSysWrite"), "NaClSysWrite");
    }
}
