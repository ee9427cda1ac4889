//! # Calling Convention
//!
//! Argument and return-value placement for the 32-bit Arm procedure call
//! standard (AAPCS32), as used by Cortex-M firmware.
//!
//! This module is pure bookkeeping: given already-encoded argument bytes,
//! it decides which words go into `r0`-`r3` and which bytes go onto the
//! stack. Reading and writing the actual target is the call engine's job.
//!
//! The rules implemented here:
//!
//! - The first four words of arguments go to `r0`-`r3`.
//! - Arguments with 8-byte alignment start at an even register, skipping
//!   one if necessary, and at an 8-byte aligned stack slot.
//! - A composite may be split between the last registers and the stack,
//!   but once any argument has gone to the stack, later arguments stay
//!   on the stack.
//! - Results up to 4 bytes come back in `r0`; 8-byte scalars in `r0:r1`;
//!   larger composites are written through a hidden pointer passed as a
//!   first argument in `r0`.

use smallvec::SmallVec;

use crate::error::{OnTargetError, OnTargetResult};
use crate::symbols::TypeLayout;
use crate::types::registers::{XPSR_IT_MASK, XPSR_THUMB_BIT};
use crate::types::Endianness;

/// Number of argument registers (`r0`-`r3`).
pub const ARG_REGISTERS: usize = 4;

/// Required stack pointer alignment at a public interface.
pub const STACK_ALIGNMENT: u64 = 8;

/// One argument, already encoded to target bytes.
#[derive(Debug, Clone)]
pub struct EncodedArg
{
    /// The argument's byte image in target byte order.
    pub bytes: Vec<u8>,
    /// Natural alignment of the argument's type.
    pub alignment: u64,
}

impl EncodedArg
{
    /// Bundles encoded bytes with their type's alignment.
    #[must_use]
    pub const fn new(bytes: Vec<u8>, alignment: u64) -> Self
    {
        Self { bytes, alignment }
    }
}

/// Where a function's result lives after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetConvention
{
    /// No result.
    Void,
    /// The low `size` bytes of `r0`.
    InR0
    {
        /// Result size in bytes.
        size: u64,
    },
    /// An 8-byte scalar in `r0` and `r1`.
    InR0R1,
    /// Written through a caller-allocated buffer whose address is passed
    /// in `r0`.
    Indirect
    {
        /// Result size in bytes.
        size: u64,
        /// Required buffer alignment.
        alignment: u64,
    },
}

/// A complete placement decision for one call.
#[derive(Debug, Clone)]
pub struct CallPlan
{
    /// Values for `r0..`, at most [`ARG_REGISTERS`] of them. When the
    /// return convention is [`RetConvention::Indirect`], slot 0 is a
    /// placeholder for the hidden result pointer.
    pub reg_words: SmallVec<[u32; ARG_REGISTERS]>,
    /// Bytes placed at the final stack pointer, lowest address first.
    pub stack: Vec<u8>,
    /// Where the result will be.
    pub ret: RetConvention,
}

impl CallPlan
{
    /// Returns `true` when slot 0 of `reg_words` must be filled with the
    /// address of a result buffer before the call.
    #[must_use]
    pub const fn needs_result_buffer(&self) -> bool
    {
        matches!(self.ret, RetConvention::Indirect { .. })
    }
}

/// Decides the return convention for a result type.
///
/// ## Errors
///
/// Returns a `TypeMismatch` for types that cannot be returned, such as
/// bare function types or zero-sized results.
pub fn return_convention(ret: Option<&TypeLayout>) -> OnTargetResult<RetConvention>
{
    let Some(layout) = ret
    else
    {
        return Ok(RetConvention::Void);
    };
    let size = layout.size();
    match layout
    {
        TypeLayout::Scalar { .. } | TypeLayout::Pointer { .. } => match size
        {
            1..=4 => Ok(RetConvention::InR0 { size }),
            8 => Ok(RetConvention::InR0R1),
            _ => Err(OnTargetError::TypeMismatch {
                context: "return value".to_string(),
                expected: "a 1, 2, 4 or 8 byte scalar".to_string(),
                found: format!("{} of {size} bytes", layout.name()),
            }),
        },
        TypeLayout::Struct { .. } | TypeLayout::Array { .. } =>
        {
            if size == 0
            {
                return Err(OnTargetError::TypeMismatch {
                    context: "return value".to_string(),
                    expected: "a sized type".to_string(),
                    found: format!("{} of 0 bytes", layout.name()),
                });
            }
            if size <= 4
            {
                Ok(RetConvention::InR0 { size })
            }
            else
            {
                Ok(RetConvention::Indirect { size, alignment: layout.alignment() })
            }
        }
        TypeLayout::Function { .. } => Err(OnTargetError::TypeMismatch {
            context: "return value".to_string(),
            expected: "a data type".to_string(),
            found: "a bare function type".to_string(),
        }),
    }
}

/// Plans register and stack placement for one call.
///
/// ## Errors
///
/// Returns a `TypeMismatch` for zero-sized arguments or an impossible
/// return type.
pub fn plan_call(
    args: &[EncodedArg],
    ret: Option<&TypeLayout>,
    endianness: Endianness,
) -> OnTargetResult<CallPlan>
{
    let ret = return_convention(ret)?;
    let mut reg_words: SmallVec<[u32; ARG_REGISTERS]> = SmallVec::new();
    if matches!(ret, RetConvention::Indirect { .. })
    {
        // Hidden result pointer claims r0; the engine fills it in once a
        // buffer exists.
        reg_words.push(0);
    }
    let mut stack: Vec<u8> = Vec::new();
    let mut stack_started = false;

    for (index, arg) in args.iter().enumerate()
    {
        if arg.bytes.is_empty()
        {
            return Err(OnTargetError::TypeMismatch {
                context: format!("argument {index}"),
                expected: "a sized value".to_string(),
                found: "zero bytes".to_string(),
            });
        }
        let words = to_words(&arg.bytes, endianness);

        if !stack_started
        {
            if arg.alignment == 8 && reg_words.len() % 2 == 1
            {
                // Skipped registers stay unused; the callee never reads them.
                reg_words.push(0);
            }
            if reg_words.len() + words.len() <= ARG_REGISTERS
            {
                reg_words.extend_from_slice(&words);
                continue;
            }
            if reg_words.len() < ARG_REGISTERS && arg.alignment <= 4
            {
                // Split composite: head in the remaining registers, tail
                // at the very bottom of the stack argument area.
                let head = ARG_REGISTERS - reg_words.len();
                reg_words.extend_from_slice(&words[..head]);
                stack.extend_from_slice(&arg.bytes[head * 4..]);
                pad_to(&mut stack, 4);
                stack_started = true;
                continue;
            }
        }

        stack_started = true;
        pad_to(&mut stack, arg.alignment.max(4));
        stack.extend_from_slice(&arg.bytes);
        pad_to(&mut stack, 4);
    }

    Ok(CallPlan { reg_words, stack, ret })
}

/// Reconstructs a register-resident result as target-order bytes.
///
/// Returns `None` for [`RetConvention::Void`] and
/// [`RetConvention::Indirect`], whose result is not in registers.
#[must_use]
pub fn result_bytes(ret: RetConvention, r0: u32, r1: u32, endianness: Endianness) -> Option<Vec<u8>>
{
    match ret
    {
        RetConvention::Void | RetConvention::Indirect { .. } => None,
        RetConvention::InR0 { size } =>
        {
            let bytes = word_bytes(r0, endianness);
            match endianness
            {
                Endianness::Little => Some(bytes[..size as usize].to_vec()),
                Endianness::Big => Some(bytes[4 - size as usize..].to_vec()),
            }
        }
        RetConvention::InR0R1 =>
        {
            let mut bytes = word_bytes(r0, endianness).to_vec();
            bytes.extend_from_slice(&word_bytes(r1, endianness));
            Some(bytes)
        }
    }
}

/// Clears execution state a synthetic call frame must not inherit: the
/// Thumb bit is forced on and any in-progress IT block is cancelled.
#[must_use]
pub const fn sanitize_xpsr(xpsr: u32) -> u32
{
    (xpsr | XPSR_THUMB_BIT) & !XPSR_IT_MASK
}

/// Address to place in `pc` for a call into Thumb code.
#[must_use]
pub const fn branch_target(address: u64) -> u32
{
    (address as u32) & !1
}

/// Address to place in `lr` so a return lands on the trap with the Thumb
/// interworking bit set.
#[must_use]
pub const fn link_address(address: u64) -> u32
{
    (address as u32) | 1
}

/// Splits a byte image into register words, as if the bytes were loaded
/// word-wise from target memory.
fn to_words(bytes: &[u8], endianness: Endianness) -> SmallVec<[u32; ARG_REGISTERS]>
{
    let mut words = SmallVec::new();
    for chunk in bytes.chunks(4)
    {
        let mut padded = [0u8; 4];
        padded[..chunk.len()].copy_from_slice(chunk);
        words.push(match endianness
        {
            Endianness::Little => u32::from_le_bytes(padded),
            Endianness::Big => u32::from_be_bytes(padded),
        });
    }
    words
}

fn word_bytes(word: u32, endianness: Endianness) -> [u8; 4]
{
    match endianness
    {
        Endianness::Little => word.to_le_bytes(),
        Endianness::Big => word.to_be_bytes(),
    }
}

fn pad_to(stack: &mut Vec<u8>, alignment: u64)
{
    while stack.len() as u64 % alignment != 0
    {
        stack.push(0);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn word_arg(value: u32) -> EncodedArg
    {
        EncodedArg::new(value.to_le_bytes().to_vec(), 4)
    }

    #[test]
    fn test_four_words_stay_in_registers()
    {
        let args: Vec<_> = (1u32..=4).map(word_arg).collect();
        let plan = plan_call(&args, None, Endianness::Little).unwrap();
        assert_eq!(plan.reg_words.as_slice(), &[1, 2, 3, 4]);
        assert!(plan.stack.is_empty());
    }

    #[test]
    fn test_fifth_and_sixth_word_spill()
    {
        let args: Vec<_> = (1u32..=6).map(word_arg).collect();
        let plan = plan_call(&args, None, Endianness::Little).unwrap();
        assert_eq!(plan.reg_words.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(plan.stack, [5u32.to_le_bytes(), 6u32.to_le_bytes()].concat());
    }

    #[test]
    fn test_double_word_skips_odd_register()
    {
        let args = vec![
            word_arg(1),
            EncodedArg::new(0x1122_3344_5566_7788u64.to_le_bytes().to_vec(), 8),
        ];
        let plan = plan_call(&args, None, Endianness::Little).unwrap();
        // r1 is skipped; the pair lands in r2:r3.
        assert_eq!(plan.reg_words.len(), 4);
        assert_eq!(plan.reg_words[2], 0x5566_7788);
        assert_eq!(plan.reg_words[3], 0x1122_3344);
        assert!(plan.stack.is_empty());
    }

    #[test]
    fn test_double_word_never_splits()
    {
        let args = vec![
            word_arg(1),
            word_arg(2),
            word_arg(3),
            EncodedArg::new(0xaabb_ccdd_0011_2233u64.to_le_bytes().to_vec(), 8),
        ];
        let plan = plan_call(&args, None, Endianness::Little).unwrap();
        // r3 is skipped by the alignment round-up and the pair goes to
        // the stack whole.
        assert_eq!(&plan.reg_words[..3], &[1, 2, 3]);
        assert_eq!(plan.stack.len(), 8);
        assert_eq!(plan.stack, 0xaabb_ccdd_0011_2233u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_composite_splits_across_r3()
    {
        // A 24-byte word-aligned composite starting at r2: r2, r3, then
        // 16 bytes of stack.
        let composite: Vec<u8> = (0u8..24).collect();
        let args = vec![word_arg(1), word_arg(2), EncodedArg::new(composite, 4)];
        let plan = plan_call(&args, None, Endianness::Little).unwrap();
        assert_eq!(plan.reg_words.len(), 4);
        assert_eq!(plan.stack.len(), 16);
        assert_eq!(plan.stack[0], 8);
    }

    #[test]
    fn test_no_register_backfill_after_spill()
    {
        let composite: Vec<u8> = (0u8..20).collect();
        let args = vec![EncodedArg::new(composite, 4), word_arg(7)];
        let plan = plan_call(&args, None, Endianness::Little).unwrap();
        // The composite fills r0-r3 and spills; the following word must
        // not reuse a register.
        assert_eq!(plan.reg_words.len(), 4);
        assert_eq!(plan.stack.len(), 8);
        assert_eq!(&plan.stack[4..8], &7u32.to_le_bytes());
    }

    #[test]
    fn test_indirect_result_reserves_r0()
    {
        let ret = TypeLayout::Struct { name: "pair".to_string(), size: 8, fields: Vec::new() };
        let plan = plan_call(&[word_arg(5)], Some(&ret), Endianness::Little).unwrap();
        assert!(plan.needs_result_buffer());
        assert_eq!(plan.reg_words.as_slice(), &[0, 5]);
    }

    #[test]
    fn test_result_bytes_round_trip()
    {
        let bytes = result_bytes(RetConvention::InR0 { size: 2 }, 0xbeef, 0, Endianness::Little)
            .unwrap();
        assert_eq!(bytes, vec![0xef, 0xbe]);

        let bytes =
            result_bytes(RetConvention::InR0R1, 0x5566_7788, 0x1122_3344, Endianness::Little)
                .unwrap();
        assert_eq!(bytes, 0x1122_3344_5566_7788u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_xpsr_sanitizing()
    {
        let dirty = XPSR_THUMB_BIT | (1 << 25) | (1 << 12) | 0xf000_0000;
        let clean = sanitize_xpsr(dirty);
        assert_eq!(clean & XPSR_IT_MASK, 0);
        assert_ne!(clean & XPSR_THUMB_BIT, 0);
        assert_eq!(clean & 0xf000_0000, 0xf000_0000);
    }
}
