//! # Unwinding
//!
//! Call frame information driven stack unwinding and the location
//! expression interpreter shared with variable lookup.

pub mod expression;

pub use expression::{evaluate, ExpressionContext, Location};
use tracing::{debug, trace, warn};

use crate::error::{DebuggerError, Result};
use crate::symbols::{RuleKind, RuleRegister, SymbolDatabase};
use crate::types::registers::DWARF_RSP;
use crate::types::{Address, Registers};

/// Minimal memory accessor required for unwinding and expression evaluation.
pub trait MemoryAccess
{
    /// Read exactly `length` bytes at `address`.
    fn read_bytes(&self, address: Address, length: usize) -> Result<Vec<u8>>;

    /// Read a little-endian 64-bit word.
    fn read_u64(&self, address: Address) -> Result<u64>
    {
        let bytes = self.read_bytes(address, 8)?;
        let word: [u8; 8] = bytes.as_slice().try_into().map_err(|_| DebuggerError::MemoryAccess {
            address,
            length: 8,
            reason: format!("short read of {} bytes", bytes.len()),
        })?;
        Ok(u64::from_le_bytes(word))
    }
}

/// CFI-driven stack unwinder over one module loaded at `base`.
pub struct Unwinder<'a, M: ?Sized>
{
    database: &'a SymbolDatabase,
    base: Address,
    memory: &'a M,
}

impl<'a, M: MemoryAccess + ?Sized> Unwinder<'a, M>
{
    pub fn new(database: &'a SymbolDatabase, base: Address, memory: &'a M) -> Self
    {
        Self { database, base, memory }
    }

    /// Canonical frame address of the frame described by `registers`, or
    /// `None` when no call frame covers its PC.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::Unsupported`] when the CFA is given by an expression.
    pub fn canonical_frame_address(&self, registers: &Registers) -> Result<Option<Address>>
    {
        let Some(pc) = registers.pc().relative_to(self.base) else {
            return Ok(None);
        };
        let Some(frame) = self.database.call_frame_for_address(pc) else {
            return Ok(None);
        };
        let Some(rule) = frame.rules_at(pc).remove(&RuleRegister::Cfa) else {
            return Ok(None);
        };
        match rule.kind {
            RuleKind::ValOffset {
                base: RuleRegister::Dwarf(register),
                offset,
            } => Ok(Some(Address::new(
                register_value(registers, register)?.wrapping_add_signed(offset),
            ))),
            other => Err(DebuggerError::Unsupported(format!("CFA rule {other:?}"))),
        }
    }

    /// Recover the caller's registers from the callee's.
    ///
    /// Returns `Ok(None)` at the top of the stack: the PC is outside the
    /// module, or no call frame covers it.
    ///
    /// # Errors
    ///
    /// Memory failures while reading saved registers, and
    /// [`DebuggerError::Unsupported`] for expression-based rules.
    pub fn previous_frame(&self, registers: &Registers) -> Result<Option<Registers>>
    {
        let Some(cfa) = self.canonical_frame_address(registers)? else {
            return Ok(None);
        };
        let Some(pc) = registers.pc().relative_to(self.base) else {
            return Ok(None);
        };
        let Some(frame) = self.database.call_frame_for_address(pc) else {
            return Ok(None);
        };
        let rules = frame.rules_at(pc);
        trace!(pc = %registers.pc(), %cfa, rules = rules.len(), "applying call frame rules");

        let base_value = |base: RuleRegister| -> Result<u64> {
            match base {
                RuleRegister::Cfa => Ok(cfa.value()),
                RuleRegister::Dwarf(register) => register_value(registers, register),
            }
        };

        let mut caller = registers.clone();
        for (target, rule) in &rules {
            let RuleRegister::Dwarf(target) = *target else {
                continue;
            };
            let value = match rule.kind {
                RuleKind::Undefined | RuleKind::SameValue => continue,
                RuleKind::Offset { base, offset } => {
                    let slot = Address::new(base_value(base)?.wrapping_add_signed(offset));
                    self.memory.read_u64(slot)?
                }
                RuleKind::Register { base } => base_value(base)?,
                RuleKind::ValOffset { base, offset } => base_value(base)?.wrapping_add_signed(offset),
                RuleKind::Expression | RuleKind::ValExpression => {
                    return Err(DebuggerError::Unsupported(format!(
                        "expression rule for register {target} at {}",
                        registers.pc()
                    )));
                }
            };
            if caller.set(target, value).is_none() {
                trace!(register = target, "dropping rule for untracked register");
            }
        }

        // The caller's stack pointer is the CFA unless a rule says otherwise.
        if !rules.contains_key(&RuleRegister::Dwarf(DWARF_RSP)) {
            let _ = caller.set(DWARF_RSP, cfa.value());
        }
        Ok(Some(caller))
    }

    /// Walk the stack from `registers`, innermost first.
    ///
    /// The first element is `registers` itself. Walking stops at a zero PC,
    /// when no call frame covers the PC, when a frame makes no progress,
    /// after `max_frames` frames, or on the first error (which is logged).
    pub fn unwind(&self, registers: &Registers, max_frames: usize) -> Vec<Registers>
    {
        let mut frames = Vec::new();
        let mut current = registers.clone();
        while frames.len() < max_frames && current.pc() != Address::ZERO {
            frames.push(current.clone());
            match self.previous_frame(&current) {
                Ok(Some(caller)) => {
                    if caller.pc() == current.pc() && caller.sp() == current.sp() {
                        debug!(pc = %current.pc(), "unwinding made no progress");
                        break;
                    }
                    current = caller;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(pc = %current.pc(), error = %err, "stopping unwind");
                    break;
                }
            }
        }
        frames
    }
}

fn register_value(registers: &Registers, register: u16) -> Result<u64>
{
    registers
        .get(register)
        .ok_or_else(|| DebuggerError::RegisterAccess(format!("DWARF register {register} is not tracked")))
}

/// Expression inputs for one stack frame.
pub struct FrameContext<'a, M: ?Sized>
{
    registers: &'a Registers,
    memory: &'a M,
    base: Address,
    frame_base: Option<u64>,
    cfa: Option<u64>,
}

impl<'a, M: MemoryAccess + ?Sized> FrameContext<'a, M>
{
    pub fn new(registers: &'a Registers, memory: &'a M, base: Address) -> Self
    {
        Self {
            registers,
            memory,
            base,
            frame_base: None,
            cfa: None,
        }
    }

    #[must_use]
    pub fn with_frame_base(mut self, frame_base: Option<u64>) -> Self
    {
        self.frame_base = frame_base;
        self
    }

    #[must_use]
    pub fn with_cfa(mut self, cfa: Option<Address>) -> Self
    {
        self.cfa = cfa.map(Address::value);
        self
    }
}

impl<M: MemoryAccess + ?Sized> ExpressionContext for FrameContext<'_, M>
{
    fn register(&self, register: u16) -> Option<u64>
    {
        self.registers.get(register)
    }

    fn frame_base(&self) -> Option<u64>
    {
        self.frame_base
    }

    fn call_frame_cfa(&self) -> Option<u64>
    {
        self.cfa
    }

    fn read_memory(&self, address: u64, size: u8) -> Result<u64>
    {
        let bytes = self.memory.read_bytes(Address::new(address), usize::from(size))?;
        let mut word = [0u8; 8];
        let length = bytes.len().min(8);
        word[..length].copy_from_slice(&bytes[..length]);
        Ok(u64::from_le_bytes(word))
    }

    fn relocate(&self, address: u64) -> u64
    {
        address.wrapping_add(self.base.value())
    }
}
