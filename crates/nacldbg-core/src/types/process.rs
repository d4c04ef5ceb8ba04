//! Thread, stop reason and architecture types.

use std::fmt;

/// Thread identifier as reported by the remote stub
///
/// The stub numbers threads itself (`qfThreadInfo` replies, `thread:` fields
/// in stop replies); the value has no meaning outside the session.
///
/// ```rust
/// use nacldbg_core::types::ThreadId;
///
/// let thread = ThreadId::from(2);
/// assert_eq!(thread.raw(), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Raw identifier.
    #[must_use]
    pub const fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:x}", self.0)
    }
}

/// Why the target stopped, decoded from a stop reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason
{
    /// `S`/`T` reply: stopped by a signal (5 is the trap signal used for
    /// breakpoints and single steps)
    Signal(u8),
    /// `W` reply: the process exited with a status code
    Exited(u8),
    /// `X` reply: the process was terminated by a signal
    Terminated(u8),
}

impl StopReason
{
    /// Whether the target can still be inspected after this stop.
    #[must_use]
    pub const fn is_alive(self) -> bool
    {
        matches!(self, Self::Signal(_))
    }
}

impl fmt::Display for StopReason
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Signal(signal) => write!(f, "stopped by signal {signal}"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Terminated(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Target architecture as announced by the stub's target description
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit x86 (`i386:x86-64`)
    X86_64,
    /// 32-bit x86 (`i386`)
    X86,
    /// 32-bit ARM (`arm`)
    Arm,
    /// Anything else; carries the name the stub reported
    Unknown(String),
}

impl Architecture
{
    /// Parse the contents of an `<architecture>` element.
    #[must_use]
    pub fn from_target_name(name: &str) -> Self
    {
        match name.trim() {
            "i386:x86-64" | "x86-64" | "x86_64" => Self::X86_64,
            "i386" | "i386:intel" => Self::X86,
            arm if arm.starts_with("arm") => Self::Arm,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Extract the architecture from a `target.xml` document.
    ///
    /// Returns `Unknown("")` when the document has no `<architecture>` element.
    #[must_use]
    pub fn from_target_description(xml: &str) -> Self
    {
        const OPEN: &str = "<architecture>";
        const CLOSE: &str = "</architecture>";
        xml.find(OPEN)
            .and_then(|start| {
                let rest = &xml[start + OPEN.len()..];
                rest.find(CLOSE).map(|end| &rest[..end])
            })
            .map_or_else(|| Self::Unknown(String::new()), Self::from_target_name)
    }

    /// Size of a pointer in bytes.
    #[must_use]
    pub const fn pointer_size_bytes(&self) -> u8
    {
        match self {
            Self::X86 | Self::Arm => 4,
            Self::X86_64 | Self::Unknown(_) => 8,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::X86 => write!(f, "x86"),
            Self::Arm => write!(f, "arm"),
            Self::Unknown(name) if name.is_empty() => write!(f, "unknown"),
            Self::Unknown(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_architecture_from_target_description()
    {
        let xml = "<target><architecture>i386:x86-64</architecture></target>";
        assert_eq!(Architecture::from_target_description(xml), Architecture::X86_64);
        assert_eq!(
            Architecture::from_target_description("<target/>"),
            Architecture::Unknown(String::new())
        );
        assert_eq!(Architecture::from_target_name("mips"), Architecture::Unknown("mips".into()));
    }
}
