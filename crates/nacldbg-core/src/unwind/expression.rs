//! DWARF location expression interpreter.
//!
//! A small stack machine over the `DW_OP_*` byte code found in
//! `DW_AT_location`, `DW_AT_frame_base` and location lists. Inputs come from
//! an [`ExpressionContext`]: the frame's registers, its frame base, its
//! canonical frame address and target memory.
//!
//! Variables that live in registers (`DW_OP_reg*`) are reported as
//! [`Location::Register`] so callers can flag them instead of reading the
//! wrong memory.

use gimli::{constants, DwOp, EndianSlice, LittleEndian, Reader};
use smallvec::SmallVec;
use tracing::trace;

use crate::error::{DebuggerError, Result};

/// Upper bound on executed operations, so a backwards `DW_OP_bra` cannot spin.
const MAX_OPERATIONS: usize = 10_000;

/// What an expression evaluates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location
{
    /// The object lives in memory at this address
    Address(u64),
    /// The object lives in this DWARF register
    Register(u16),
    /// The object has no location; this is its value
    Value(u64),
}

/// Inputs the interpreter reads while evaluating.
pub trait ExpressionContext
{
    /// Value of a DWARF-numbered register.
    fn register(&self, register: u16) -> Option<u64>;

    /// Frame base of the enclosing function, for `DW_OP_fbreg`.
    fn frame_base(&self) -> Option<u64>
    {
        None
    }

    /// Canonical frame address, for `DW_OP_call_frame_cfa`.
    fn call_frame_cfa(&self) -> Option<u64>
    {
        None
    }

    /// Read `size` bytes (1 to 8) of little-endian target memory.
    fn read_memory(&self, address: u64, size: u8) -> Result<u64>;

    /// Map a module-relative `DW_OP_addr` operand to a process address.
    fn relocate(&self, address: u64) -> u64
    {
        address
    }

    /// Size of `DW_OP_addr` operands and of `DW_OP_deref` reads.
    fn address_size(&self) -> u8
    {
        8
    }
}

/// Evaluate `expression` and return where the object lives.
///
/// # Errors
///
/// [`DebuggerError::MalformedExpression`] for truncated operands, stack
/// underflow, division by zero or an empty result;
/// [`DebuggerError::Unsupported`] for opcodes outside the supported set.
/// Register and memory failures from the context propagate unchanged.
pub fn evaluate<C: ExpressionContext + ?Sized>(expression: &[u8], context: &C) -> Result<Location>
{
    Evaluator::new(expression, context).run()
}

struct Evaluator<'a, C: ?Sized>
{
    bytes: &'a [u8],
    reader: EndianSlice<'a, LittleEndian>,
    context: &'a C,
    stack: SmallVec<[u64; 16]>,
}

impl<'a, C: ExpressionContext + ?Sized> Evaluator<'a, C>
{
    fn new(bytes: &'a [u8], context: &'a C) -> Self
    {
        Self {
            bytes,
            reader: EndianSlice::new(bytes, LittleEndian),
            context,
            stack: SmallVec::new(),
        }
    }

    fn run(mut self) -> Result<Location>
    {
        let mut executed = 0usize;
        while !self.reader.is_empty() {
            executed += 1;
            if executed > MAX_OPERATIONS {
                return Err(DebuggerError::MalformedExpression(
                    "expression did not terminate".to_string(),
                ));
            }

            let op = DwOp(self.operand(Reader::read_u8)?);
            trace!(op = %op, depth = self.stack.len(), "evaluating");
            if let Some(location) = self.step(op)? {
                return Ok(location);
            }
        }

        self.stack
            .pop()
            .map(Location::Address)
            .ok_or_else(|| DebuggerError::MalformedExpression("expression left an empty stack".to_string()))
    }

    /// Execute one operation; `Some` ends evaluation early.
    fn step(&mut self, op: DwOp) -> Result<Option<Location>>
    {
        let code = op.0;
        if (constants::DW_OP_lit0.0..=constants::DW_OP_lit31.0).contains(&code) {
            self.push(u64::from(code - constants::DW_OP_lit0.0));
            return Ok(None);
        }
        if (constants::DW_OP_reg0.0..=constants::DW_OP_reg31.0).contains(&code) {
            return Ok(Some(Location::Register(u16::from(code - constants::DW_OP_reg0.0))));
        }
        if (constants::DW_OP_breg0.0..=constants::DW_OP_breg31.0).contains(&code) {
            let offset = self.operand(Reader::read_sleb128)?;
            let value = self.register(u16::from(code - constants::DW_OP_breg0.0))?;
            self.push(value.wrapping_add_signed(offset));
            return Ok(None);
        }

        match op {
            constants::DW_OP_addr => {
                let address = match self.context.address_size() {
                    4 => u64::from(self.operand(Reader::read_u32)?),
                    _ => self.operand(Reader::read_u64)?,
                };
                self.push(self.context.relocate(address));
            }
            constants::DW_OP_const1u => {
                let value = self.operand(Reader::read_u8)?;
                self.push(value.into());
            }
            constants::DW_OP_const1s => {
                let value = self.operand(Reader::read_i8)?;
                self.push_signed(value.into());
            }
            constants::DW_OP_const2u => {
                let value = self.operand(Reader::read_u16)?;
                self.push(value.into());
            }
            constants::DW_OP_const2s => {
                let value = self.operand(Reader::read_i16)?;
                self.push_signed(value.into());
            }
            constants::DW_OP_const4u => {
                let value = self.operand(Reader::read_u32)?;
                self.push(value.into());
            }
            constants::DW_OP_const4s => {
                let value = self.operand(Reader::read_i32)?;
                self.push_signed(value.into());
            }
            constants::DW_OP_const8u => {
                let value = self.operand(Reader::read_u64)?;
                self.push(value);
            }
            constants::DW_OP_const8s => {
                let value = self.operand(Reader::read_i64)?;
                self.push_signed(value);
            }
            constants::DW_OP_constu => {
                let value = self.operand(Reader::read_uleb128)?;
                self.push(value);
            }
            constants::DW_OP_consts => {
                let value = self.operand(Reader::read_sleb128)?;
                self.push_signed(value);
            }
            constants::DW_OP_fbreg => {
                let offset = self.operand(Reader::read_sleb128)?;
                let base = self.context.frame_base().ok_or_else(|| {
                    DebuggerError::MalformedExpression("DW_OP_fbreg without a frame base".to_string())
                })?;
                self.push(base.wrapping_add_signed(offset));
            }
            constants::DW_OP_bregx => {
                let register = self.register_operand()?;
                let offset = self.operand(Reader::read_sleb128)?;
                let value = self.register(register)?;
                self.push(value.wrapping_add_signed(offset));
            }
            constants::DW_OP_regx => {
                let register = self.register_operand()?;
                return Ok(Some(Location::Register(register)));
            }
            constants::DW_OP_call_frame_cfa => {
                let cfa = self.context.call_frame_cfa().ok_or_else(|| {
                    DebuggerError::Unsupported("DW_OP_call_frame_cfa outside call frame information".to_string())
                })?;
                self.push(cfa);
            }
            constants::DW_OP_stack_value => {
                let value = self.pop(op)?;
                return Ok(Some(Location::Value(value)));
            }

            constants::DW_OP_dup => {
                let value = self.peek(0, op)?;
                self.push(value);
            }
            constants::DW_OP_drop => {
                self.pop(op)?;
            }
            constants::DW_OP_over => {
                let value = self.peek(1, op)?;
                self.push(value);
            }
            constants::DW_OP_pick => {
                let index = self.operand(Reader::read_u8)?;
                let value = self.peek(usize::from(index), op)?;
                self.push(value);
            }
            constants::DW_OP_swap => {
                let top = self.pop(op)?;
                let second = self.pop(op)?;
                self.push(top);
                self.push(second);
            }
            constants::DW_OP_rot => {
                let top = self.pop(op)?;
                let second = self.pop(op)?;
                let third = self.pop(op)?;
                self.push(top);
                self.push(third);
                self.push(second);
            }

            constants::DW_OP_deref => {
                let address = self.pop(op)?;
                let value = self.context.read_memory(address, self.context.address_size())?;
                self.push(value);
            }
            constants::DW_OP_deref_size => {
                let size = self.operand(Reader::read_u8)?;
                if size == 0 || size > 8 {
                    return Err(DebuggerError::MalformedExpression(format!(
                        "DW_OP_deref_size with size {size}"
                    )));
                }
                let address = self.pop(op)?;
                let value = self.context.read_memory(address, size)?;
                self.push(value);
            }

            constants::DW_OP_abs => {
                let value = self.pop(op)? as i64;
                self.push(value.unsigned_abs());
            }
            constants::DW_OP_neg => {
                let value = self.pop(op)? as i64;
                self.push_signed(value.wrapping_neg());
            }
            constants::DW_OP_not => {
                let value = self.pop(op)?;
                self.push(!value);
            }
            constants::DW_OP_plus_uconst => {
                let addend = self.operand(Reader::read_uleb128)?;
                let value = self.pop(op)?;
                self.push(value.wrapping_add(addend));
            }
            constants::DW_OP_and
            | constants::DW_OP_div
            | constants::DW_OP_minus
            | constants::DW_OP_mod
            | constants::DW_OP_mul
            | constants::DW_OP_or
            | constants::DW_OP_plus
            | constants::DW_OP_shl
            | constants::DW_OP_shr
            | constants::DW_OP_shra
            | constants::DW_OP_xor
            | constants::DW_OP_eq
            | constants::DW_OP_ge
            | constants::DW_OP_gt
            | constants::DW_OP_le
            | constants::DW_OP_lt
            | constants::DW_OP_ne => {
                let right = self.pop(op)?;
                let left = self.pop(op)?;
                self.push(binary(op, left, right)?);
            }

            constants::DW_OP_skip => {
                let displacement = self.operand(Reader::read_i16)?;
                self.jump(displacement)?;
            }
            constants::DW_OP_bra => {
                let displacement = self.operand(Reader::read_i16)?;
                if self.pop(op)? != 0 {
                    self.jump(displacement)?;
                }
            }

            // Composite locations are reduced to their first piece.
            constants::DW_OP_piece => {
                self.operand(Reader::read_uleb128)?;
                let address = self.stack.pop().ok_or_else(|| {
                    DebuggerError::Unsupported("optimized-out first piece of a composite location".to_string())
                })?;
                return Ok(Some(Location::Address(address)));
            }
            constants::DW_OP_nop => {}

            other => {
                return Err(DebuggerError::Unsupported(format!("location expression opcode {other}")));
            }
        }
        Ok(None)
    }

    fn operand<T>(&mut self, read: impl FnOnce(&mut EndianSlice<'a, LittleEndian>) -> gimli::Result<T>) -> Result<T>
    {
        read(&mut self.reader)
            .map_err(|err| DebuggerError::MalformedExpression(format!("truncated operand: {err}")))
    }

    fn register_operand(&mut self) -> Result<u16>
    {
        let register = self.operand(Reader::read_uleb128)?;
        u16::try_from(register)
            .map_err(|_| DebuggerError::MalformedExpression(format!("register number {register} out of range")))
    }

    fn register(&self, register: u16) -> Result<u64>
    {
        self.context
            .register(register)
            .ok_or_else(|| DebuggerError::RegisterAccess(format!("DWARF register {register} is not available")))
    }

    fn push(&mut self, value: u64)
    {
        self.stack.push(value);
    }

    fn push_signed(&mut self, value: i64)
    {
        self.stack.push(value as u64);
    }

    fn pop(&mut self, op: DwOp) -> Result<u64>
    {
        self.stack
            .pop()
            .ok_or_else(|| DebuggerError::MalformedExpression(format!("stack underflow at {op}")))
    }

    fn peek(&self, depth: usize, op: DwOp) -> Result<u64>
    {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|index| self.stack[index])
            .ok_or_else(|| DebuggerError::MalformedExpression(format!("stack underflow at {op}")))
    }

    /// Branch relative to the end of the current operation.
    fn jump(&mut self, displacement: i16) -> Result<()>
    {
        let position = self.bytes.len() - self.reader.len();
        let target = position
            .checked_add_signed(isize::from(displacement))
            .filter(|&target| target <= self.bytes.len())
            .ok_or_else(|| {
                DebuggerError::MalformedExpression(format!("branch to {displacement:+} leaves the expression"))
            })?;
        self.reader = EndianSlice::new(&self.bytes[target..], LittleEndian);
        Ok(())
    }
}

fn binary(op: DwOp, left: u64, right: u64) -> Result<u64>
{
    let (signed_left, signed_right) = (left as i64, right as i64);
    let value = match op {
        constants::DW_OP_and => left & right,
        constants::DW_OP_or => left | right,
        constants::DW_OP_xor => left ^ right,
        constants::DW_OP_plus => left.wrapping_add(right),
        constants::DW_OP_minus => left.wrapping_sub(right),
        constants::DW_OP_mul => left.wrapping_mul(right),
        constants::DW_OP_div => {
            if right == 0 {
                return Err(DebuggerError::MalformedExpression("division by zero".to_string()));
            }
            signed_left.wrapping_div(signed_right) as u64
        }
        constants::DW_OP_mod => {
            if right == 0 {
                return Err(DebuggerError::MalformedExpression("modulo by zero".to_string()));
            }
            left % right
        }
        constants::DW_OP_shl => left.checked_shl(shift_amount(right)).unwrap_or(0),
        constants::DW_OP_shr => left.checked_shr(shift_amount(right)).unwrap_or(0),
        constants::DW_OP_shra => {
            let shift = shift_amount(right).min(63);
            (signed_left >> shift) as u64
        }
        constants::DW_OP_eq => u64::from(signed_left == signed_right),
        constants::DW_OP_ne => u64::from(signed_left != signed_right),
        constants::DW_OP_ge => u64::from(signed_left >= signed_right),
        constants::DW_OP_gt => u64::from(signed_left > signed_right),
        constants::DW_OP_le => u64::from(signed_left <= signed_right),
        constants::DW_OP_lt => u64::from(signed_left < signed_right),
        other => return Err(DebuggerError::Unsupported(format!("binary operator {other}"))),
    };
    Ok(value)
}

fn shift_amount(value: u64) -> u32
{
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct Frame
    {
        registers: HashMap<u16, u64>,
        memory: HashMap<u64, u64>,
        frame_base: Option<u64>,
        cfa: Option<u64>,
        base: u64,
    }

    impl ExpressionContext for Frame
    {
        fn register(&self, register: u16) -> Option<u64>
        {
            self.registers.get(&register).copied()
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
            let value = self.memory.get(&address).copied().ok_or(DebuggerError::MemoryAccess {
                address: address.into(),
                length: usize::from(size),
                reason: "unmapped".to_string(),
            })?;
            Ok(if size >= 8 { value } else { value & ((1u64 << (size * 8)) - 1) })
        }

        fn relocate(&self, address: u64) -> u64
        {
            address + self.base
        }
    }

    #[test]
    fn test_literal_arithmetic()
    {
        // lit7 lit5 minus
        let expression = [0x37, 0x35, 0x1c];
        assert_eq!(evaluate(&expression, &Frame::default()).unwrap(), Location::Address(2));
    }

    #[test]
    fn test_fbreg_uses_frame_base()
    {
        let frame = Frame {
            frame_base: Some(0x1000),
            ..Frame::default()
        };
        // DW_OP_fbreg -20
        let expression = [0x91, 0x6c];
        assert_eq!(evaluate(&expression, &frame).unwrap(), Location::Address(0x1000 - 20));
    }

    #[test]
    fn test_fbreg_without_frame_base_is_malformed()
    {
        let err = evaluate(&[0x91, 0x00], &Frame::default()).unwrap_err();
        assert!(matches!(err, DebuggerError::MalformedExpression(_)));
    }

    #[test]
    fn test_breg_adds_offset_to_register()
    {
        let mut frame = Frame::default();
        frame.registers.insert(6, 0x7fff_0000);
        // DW_OP_breg6 +16
        let expression = [0x76, 0x10];
        assert_eq!(evaluate(&expression, &frame).unwrap(), Location::Address(0x7fff_0010));
    }

    #[test]
    fn test_register_location_is_reported()
    {
        assert_eq!(evaluate(&[0x53], &Frame::default()).unwrap(), Location::Register(3));
        // DW_OP_regx 17
        assert_eq!(evaluate(&[0x90, 0x11], &Frame::default()).unwrap(), Location::Register(17));
    }

    #[test]
    fn test_deref_reads_memory()
    {
        let mut frame = Frame::default();
        frame.registers.insert(7, 0x2000);
        frame.memory.insert(0x2008, 0xdead_beef);
        // DW_OP_breg7 +8, DW_OP_deref
        let expression = [0x77, 0x08, 0x06];
        assert_eq!(evaluate(&expression, &frame).unwrap(), Location::Address(0xdead_beef));
    }

    #[test]
    fn test_addr_is_relocated()
    {
        let frame = Frame {
            base: 0x1_0000_0000,
            ..Frame::default()
        };
        let mut expression = vec![0x03];
        expression.extend_from_slice(&0x4000u64.to_le_bytes());
        assert_eq!(evaluate(&expression, &frame).unwrap(), Location::Address(0x1_0000_4000));
    }

    #[test]
    fn test_stack_value()
    {
        // DW_OP_const1u 42, DW_OP_stack_value
        assert_eq!(evaluate(&[0x08, 42, 0x9f], &Frame::default()).unwrap(), Location::Value(42));
    }

    #[test]
    fn test_branch_skips_when_condition_set()
    {
        // lit1 bra +1 lit5 lit9 -> lit5 skipped, stack [9]
        let expression = [0x31, 0x28, 0x01, 0x00, 0x35, 0x39];
        assert_eq!(evaluate(&expression, &Frame::default()).unwrap(), Location::Address(9));

        // lit0 bra +1 lit5 -> falls through, stack [5]
        let expression = [0x30, 0x28, 0x01, 0x00, 0x35];
        assert_eq!(evaluate(&expression, &Frame::default()).unwrap(), Location::Address(5));
    }

    #[test]
    fn test_backward_loop_is_bounded()
    {
        // skip -3 jumps back onto itself forever
        let err = evaluate(&[0x2f, 0xfd, 0xff], &Frame::default()).unwrap_err();
        assert!(matches!(err, DebuggerError::MalformedExpression(_)));
    }

    #[test]
    fn test_call_frame_cfa()
    {
        let frame = Frame {
            cfa: Some(0x5000),
            ..Frame::default()
        };
        assert_eq!(evaluate(&[0x9c], &frame).unwrap(), Location::Address(0x5000));
    }

    #[test]
    fn test_underflow_and_unknown_opcodes()
    {
        assert!(matches!(
            evaluate(&[0x22], &Frame::default()),
            Err(DebuggerError::MalformedExpression(_))
        ));
        // DW_OP_push_object_address
        assert!(matches!(
            evaluate(&[0x97], &Frame::default()),
            Err(DebuggerError::Unsupported(_))
        ));
        assert!(matches!(
            evaluate(&[], &Frame::default()),
            Err(DebuggerError::MalformedExpression(_))
        ));
    }

    #[test]
    fn test_composite_location_uses_first_piece()
    {
        // lit1 piece 4, lit2 piece 4
        let expression = [0x31, 0x93, 0x04, 0x32, 0x93, 0x04];
        assert_eq!(evaluate(&expression, &Frame::default()).unwrap(), Location::Address(1));

        // piece 4 with nothing on the stack
        assert!(matches!(
            evaluate(&[0x93, 0x04], &Frame::default()),
            Err(DebuggerError::Unsupported(_))
        ));
    }

    #[test]
    fn test_division_by_zero()
    {
        let err = evaluate(&[0x34, 0x30, 0x1b], &Frame::default()).unwrap_err();
        assert!(matches!(err, DebuggerError::MalformedExpression(_)));
    }
}
