//! x86-64 register file.
//!
//! Registers are indexed by their DWARF register numbers, which is what call
//! frame rules and location expressions name. The remote stub transfers them
//! in GDB's order instead; [`Registers::from_gdb_bytes`] and
//! [`Registers::to_gdb_bytes`] translate between the two.

use std::fmt;

use super::Address;
use crate::error::{DebuggerError, Result};

/// DWARF number of `rbp`.
pub const DWARF_RBP: u16 = 6;
/// DWARF number of `rsp`.
pub const DWARF_RSP: u16 = 7;
/// DWARF number of `r15`, which holds the sandbox base.
pub const DWARF_R15: u16 = 15;
/// DWARF number of the return address column (`rip`).
pub const DWARF_RIP: u16 = 16;
/// DWARF number of `rflags`.
pub const DWARF_EFLAGS: u16 = 49;

const GENERAL_COUNT: usize = 17;
const SEGMENT_COUNT: usize = 6;
const DWARF_SEGMENT_BASE: u16 = 50;

/// GDB register order for x86-64 (`rax rbx rcx rdx rsi rdi rbp rsp r8..r15
/// rip`) expressed as DWARF numbers.
const GDB_TO_DWARF: [u16; GENERAL_COUNT] = [0, 3, 2, 1, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

/// GDB order of the 32-bit segment registers after `eflags` (`cs ss ds es
/// fs gs`) as offsets from DWARF 50 (`es cs ss ds fs gs`).
const GDB_SEGMENT_TO_DWARF: [u16; SEGMENT_COUNT] = [1, 2, 3, 0, 4, 5];

const DWARF_NAMES: [&str; GENERAL_COUNT] = [
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15", "rip",
];
const SEGMENT_NAMES: [&str; SEGMENT_COUNT] = ["es", "cs", "ss", "ds", "fs", "gs"];

/// Size of the general-purpose part of a `g` reply: 17 64-bit registers
/// followed by 32-bit `eflags`.
pub const GDB_MIN_REGISTER_BYTES: usize = GENERAL_COUNT * 8 + 4;
/// Size of a full `g` reply including the segment registers.
pub const GDB_REGISTER_BYTES: usize = GDB_MIN_REGISTER_BYTES + SEGMENT_COUNT * 4;

/// Snapshot of a thread's registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers
{
    general: [u64; GENERAL_COUNT],
    /// `rflags` (DWARF 49)
    pub eflags: u32,
    segments: [u32; SEGMENT_COUNT],
}

impl Registers
{
    /// All registers zero.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Read a register by DWARF number.
    ///
    /// Returns `None` for registers outside the integer file (vector
    /// registers, x87, ...).
    #[must_use]
    pub fn get(&self, dwarf_register: u16) -> Option<u64>
    {
        match dwarf_register {
            0..=16 => Some(self.general[usize::from(dwarf_register)]),
            DWARF_EFLAGS => Some(u64::from(self.eflags)),
            50..=55 => Some(u64::from(self.segments[usize::from(dwarf_register - DWARF_SEGMENT_BASE)])),
            _ => None,
        }
    }

    /// Write a register by DWARF number; `None` if the register is not
    /// tracked.
    ///
    /// 32-bit registers keep the low half of `value`.
    pub fn set(&mut self, dwarf_register: u16, value: u64) -> Option<()>
    {
        match dwarf_register {
            0..=16 => self.general[usize::from(dwarf_register)] = value,
            DWARF_EFLAGS => self.eflags = value as u32,
            50..=55 => self.segments[usize::from(dwarf_register - DWARF_SEGMENT_BASE)] = value as u32,
            _ => return None,
        }
        Some(())
    }

    /// Instruction pointer.
    #[must_use]
    pub const fn pc(&self) -> Address
    {
        Address::new(self.general[DWARF_RIP as usize])
    }

    /// Replace the instruction pointer.
    pub fn set_pc(&mut self, pc: Address)
    {
        self.general[DWARF_RIP as usize] = pc.value();
    }

    /// Stack pointer.
    #[must_use]
    pub const fn sp(&self) -> Address
    {
        Address::new(self.general[DWARF_RSP as usize])
    }

    /// Frame pointer.
    #[must_use]
    pub const fn fp(&self) -> Address
    {
        Address::new(self.general[DWARF_RBP as usize])
    }

    /// Decode a `g` reply (already hex-decoded).
    ///
    /// The segment registers are optional; a reply that stops after
    /// `eflags` leaves them at zero.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::RegisterAccess`] if the reply is shorter than the
    /// general-purpose block. The stub sends a short reply when it has fallen
    /// out of step with the debugger.
    pub fn from_gdb_bytes(bytes: &[u8]) -> Result<Self>
    {
        if bytes.len() < GDB_MIN_REGISTER_BYTES {
            return Err(DebuggerError::RegisterAccess(format!(
                "register reply has {} bytes, expected at least {GDB_MIN_REGISTER_BYTES}",
                bytes.len()
            )));
        }

        let mut registers = Self::new();
        for (slot, chunk) in bytes.chunks_exact(8).take(GENERAL_COUNT).enumerate() {
            registers.general[usize::from(GDB_TO_DWARF[slot])] = u64::from_le_bytes(le_array(chunk));
        }

        let mut words = bytes[GENERAL_COUNT * 8..]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(le_array(chunk)));
        registers.eflags = words.next().unwrap_or_default();
        for (slot, value) in words.take(SEGMENT_COUNT).enumerate() {
            registers.segments[usize::from(GDB_SEGMENT_TO_DWARF[slot])] = value;
        }
        Ok(registers)
    }

    /// Encode in `g` / `G` layout (before hex encoding).
    #[must_use]
    pub fn to_gdb_bytes(&self) -> Vec<u8>
    {
        let mut bytes = Vec::with_capacity(GDB_REGISTER_BYTES);
        for dwarf in GDB_TO_DWARF {
            bytes.extend_from_slice(&self.general[usize::from(dwarf)].to_le_bytes());
        }
        bytes.extend_from_slice(&self.eflags.to_le_bytes());
        for dwarf in GDB_SEGMENT_TO_DWARF {
            bytes.extend_from_slice(&self.segments[usize::from(dwarf)].to_le_bytes());
        }
        bytes
    }

    /// Human-readable name of a DWARF register number.
    #[must_use]
    pub fn name(dwarf_register: u16) -> Option<&'static str>
    {
        match dwarf_register {
            0..=16 => Some(DWARF_NAMES[usize::from(dwarf_register)]),
            DWARF_EFLAGS => Some("eflags"),
            50..=55 => Some(SEGMENT_NAMES[usize::from(dwarf_register - DWARF_SEGMENT_BASE)]),
            _ => None,
        }
    }

    /// `(name, value)` pairs in GDB order, for display.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_
    {
        GDB_TO_DWARF
            .iter()
            .map(|&dwarf| (DWARF_NAMES[usize::from(dwarf)], self.general[usize::from(dwarf)]))
            .chain(std::iter::once(("eflags", u64::from(self.eflags))))
            .chain(
                GDB_SEGMENT_TO_DWARF
                    .iter()
                    .map(|&slot| (SEGMENT_NAMES[usize::from(slot)], u64::from(self.segments[usize::from(slot)]))),
            )
    }
}

impl fmt::Display for Registers
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for (name, value) in self.iter() {
            writeln!(f, "{name:>6} 0x{value:016x}")?;
        }
        Ok(())
    }
}

fn le_array<const N: usize>(chunk: &[u8]) -> [u8; N]
{
    let mut array = [0u8; N];
    array.copy_from_slice(&chunk[..N]);
    array
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_gdb_order_maps_to_dwarf_numbers()
    {
        let mut bytes = Vec::new();
        for value in 0u64..17 {
            bytes.extend_from_slice(&(value + 100).to_le_bytes());
        }
        bytes.extend_from_slice(&0x246u32.to_le_bytes());

        let registers = Registers::from_gdb_bytes(&bytes).unwrap();
        // GDB slot 1 is rbx, DWARF 3.
        assert_eq!(registers.get(3), Some(101));
        // GDB slot 3 is rdx, DWARF 1.
        assert_eq!(registers.get(1), Some(103));
        assert_eq!(registers.sp(), Address::new(107));
        assert_eq!(registers.pc(), Address::new(116));
        assert_eq!(registers.get(DWARF_R15), Some(115));
        assert_eq!(registers.get(DWARF_EFLAGS), Some(0x246));
        assert_eq!(registers.get(51), Some(0));
    }

    #[test]
    fn test_short_reply_is_rejected()
    {
        let err = Registers::from_gdb_bytes(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, DebuggerError::RegisterAccess(_)));
    }

    #[test]
    fn test_gdb_bytes_round_trip_with_segments()
    {
        let mut registers = Registers::new();
        registers.set_pc(Address::new(0x1234));
        registers.set(DWARF_R15, 0x7f00_0000_0000);
        registers.set(51, 0x33);
        let bytes = registers.to_gdb_bytes();
        assert_eq!(bytes.len(), GDB_REGISTER_BYTES);
        assert_eq!(Registers::from_gdb_bytes(&bytes).unwrap(), registers);
    }

    #[test]
    fn test_unknown_register()
    {
        let mut registers = Registers::new();
        assert_eq!(registers.get(17), None);
        assert_eq!(registers.set(17, 1), None);
        assert_eq!(Registers::name(7), Some("rsp"));
    }
}
