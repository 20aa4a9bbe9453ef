//! A64 word encoders and final byte emission.
//!
//! All A64 instructions are 32 bits, little-endian. The branch encoders take a
//! byte displacement from the branch to its target and pack `disp >> 2` into
//! the kind's signed field:
//!
//! | Instruction     | Layout                                          |
//! |-----------------|-------------------------------------------------|
//! | `B` / `BL`      | `op:000101 \| imm26`                            |
//! | `B.cond`        | `01010100 \| imm19 \| 0 \| cond`                |
//! | `CBZ` / `CBNZ`  | `sf \| 011010 \| op \| imm19 \| Rt`             |
//! | `TBZ` / `TBNZ`  | `b5 \| 011011 \| op \| b40 \| imm14 \| Rt`      |

use alloc::vec::Vec;

use crate::error::{LayoutError, SplitError};
use crate::imm::{split_for_access, AccessSize};
use crate::ir::{BranchKind, Cond, Instruction, Program, Register, INSN_SIZE, TRAMPOLINE_ENTRY};
use crate::layout::Layout;
use crate::relax::target_name;

/// `NOP` (HINT #0).
pub const NOP: u32 = 0xD503_201F;

/// `B .+8`, the first word of every trampoline block.
pub const SKIP_TRAMPOLINE: u32 = 0x1400_0002;

#[inline]
fn field(disp: i64, bits: u32) -> u32 {
    ((disp >> 2) as u32) & ((1u32 << bits) - 1)
}

/// `B` (or `BL` when `link`) with a byte displacement.
#[must_use]
pub fn encode_b(link: bool, disp: i64) -> u32 {
    let op = if link { 0b100101u32 } else { 0b000101u32 };
    (op << 26) | field(disp, 26)
}

/// `B.cond` with a byte displacement.
#[must_use]
pub fn encode_b_cond(cond: Cond, disp: i64) -> u32 {
    (0b0101_0100u32 << 24) | (field(disp, 19) << 5) | cond.bits()
}

/// `CBZ` (or `CBNZ` when `nonzero`) with a byte displacement.
#[must_use]
pub fn encode_cbz(nonzero: bool, rt: Register, disp: i64) -> u32 {
    (rt.sf() << 31)
        | (0b011010 << 25)
        | (u32::from(nonzero) << 24)
        | (field(disp, 19) << 5)
        | rt.num()
}

/// `TBZ` (or `TBNZ` when `nonzero`) with a byte displacement.
#[must_use]
pub fn encode_tbz(nonzero: bool, rt: Register, bit: u8, disp: i64) -> u32 {
    let bit = u32::from(bit & 0x3F);
    ((bit >> 5) << 31)
        | (0b011011 << 25)
        | (u32::from(nonzero) << 24)
        | ((bit & 0x1F) << 19)
        | (field(disp, 14) << 5)
        | rt.num()
}

/// Encode a branch instruction with the given byte displacement.
///
/// Returns `None` for anything that is not a PC-relative branch.
#[must_use]
pub fn encode_branch(insn: &Instruction, disp: i64) -> Option<u32> {
    match insn {
        Instruction::Branch { link, .. } => Some(encode_b(*link, disp)),
        Instruction::CondBranch { cond, .. } => Some(encode_b_cond(*cond, disp)),
        Instruction::CompareBranch { nonzero, rt, .. } => Some(encode_cbz(*nonzero, *rt, disp)),
        Instruction::TestBitBranch {
            nonzero, rt, bit, ..
        } => Some(encode_tbz(*nonzero, *rt, *bit, disp)),
        Instruction::Ordinary(_)
        | Instruction::Align { .. }
        | Instruction::Trampoline { .. }
        | Instruction::Label(_) => None,
    }
}

/// Classify a branch word and recover its byte displacement.
///
/// Returns `None` for words that are not one of the four PC-relative branch
/// families.
#[must_use]
pub fn decode_branch(word: u32) -> Option<(BranchKind, i64)> {
    let sext = |value: u32, bits: u32| -> i64 {
        let shift = 32 - bits;
        i64::from(((value << shift) as i32) >> shift) * INSN_SIZE as i64
    };
    if word & 0x7C00_0000 == 0x1400_0000 {
        Some((BranchKind::Unconditional, sext(word & 0x03FF_FFFF, 26)))
    } else if word & 0xFF00_0010 == 0x5400_0000 {
        Some((BranchKind::Conditional, sext((word >> 5) & 0x7FFFF, 19)))
    } else if word & 0x7E00_0000 == 0x3400_0000 {
        Some((BranchKind::Compare, sext((word >> 5) & 0x7FFFF, 19)))
    } else if word & 0x7E00_0000 == 0x3600_0000 {
        Some((BranchKind::TestBit, sext((word >> 5) & 0x3FFF, 14)))
    } else {
        None
    }
}

// ── Large offsets ───────────────────────────────────────────────────────

/// `ADD Xd, Xn, #hi` using the LSL #12 form. `hi` must be a multiple of 4096
/// no larger than `0xFFF000`.
#[must_use]
pub fn encode_add_hi12(rd: Register, rn: Register, hi: u32) -> u32 {
    0x9140_0000 | (((hi >> 12) & 0xFFF) << 10) | (rn.num() << 5) | rd.num()
}

/// LDR/STR (unsigned offset): `size|111001|opc|imm12|Rn|Rt`.
#[must_use]
pub fn encode_ldst_uimm(access: AccessSize, load: bool, rt: Register, rn: Register, lo: u32) -> u32 {
    let opc = u32::from(load);
    (access.size_bits() << 30)
        | (0b111001 << 24)
        | (opc << 22)
        | ((lo & 0xFFF) << 10)
        | (rn.num() << 5)
        | rt.num()
}

/// Load or store `rt` at `[rn, #offset]` for an offset too large for the
/// scaled 12-bit field.
///
/// Emits `ADD tmp, rn, #hi` followed by the access through `tmp`, or just
/// the access when `hi` is zero.
///
/// # Errors
///
/// Propagates [`SplitError`] when `offset` cannot be split for `access`.
///
/// # Examples
///
/// ```
/// use a64_layout::encode::large_offset_access;
/// use a64_layout::imm::AccessSize;
/// use a64_layout::Register;
///
/// let words = large_offset_access(
///     AccessSize::Double,
///     true,
///     Register::x(0),
///     Register::x(1),
///     Register::x(16),
///     0x8008,
/// )?;
/// assert_eq!(words.len(), 2);
/// # Ok::<(), a64_layout::SplitError>(())
/// ```
pub fn large_offset_access(
    access: AccessSize,
    load: bool,
    rt: Register,
    rn: Register,
    tmp: Register,
    offset: u32,
) -> Result<Vec<u32>, SplitError> {
    let (hi, lo) = split_for_access(offset, access)?;
    let mut words = Vec::with_capacity(2);
    if hi == 0 {
        words.push(encode_ldst_uimm(access, load, rt, rn, lo));
    } else {
        words.push(encode_add_hi12(tmp, rn, hi));
        words.push(encode_ldst_uimm(access, load, rt, tmp, lo));
    }
    Ok(words)
}

// ── Emission ────────────────────────────────────────────────────────────

/// Materialise `padding` bytes starting at `offset`: zero bytes up to the next
/// word boundary, NOP words after that, zero bytes for any tail.
fn emit_padding(output: &mut Vec<u8>, offset: u64, padding: u32) {
    let mut remaining = padding as usize;
    let lead = ((u64::from(INSN_SIZE) - offset % u64::from(INSN_SIZE)) % u64::from(INSN_SIZE))
        as usize;
    let lead = lead.min(remaining);
    output.extend(core::iter::repeat(0u8).take(lead));
    remaining -= lead;
    while remaining >= INSN_SIZE as usize {
        output.extend_from_slice(&NOP.to_le_bytes());
        remaining -= INSN_SIZE as usize;
    }
    output.extend(core::iter::repeat(0u8).take(remaining));
}

/// Append the bytes of instruction `index` to `output`.
///
/// # Errors
///
/// Returns [`LayoutError::UnreachableTarget`] if a displacement does not fit
/// its field, which only happens when `layout` is not the converged layout of
/// `program`.
pub fn emit_instruction(
    program: &Program,
    layout: &Layout,
    index: usize,
    output: &mut Vec<u8>,
) -> Result<(), LayoutError> {
    let insn = &program.instructions()[index];
    let at = layout.offset(index);
    match insn {
        Instruction::Branch { target, .. }
        | Instruction::CondBranch { target, .. }
        | Instruction::CompareBranch { target, .. }
        | Instruction::TestBitBranch { target, .. } => {
            let disp = layout.target_offset(*target) as i64 - at as i64;
            let kind = insn.branch_kind();
            if !kind.is_some_and(|kind| kind.in_range(disp)) {
                return Err(LayoutError::UnreachableTarget {
                    unit: program.name().into(),
                    label: target_name(program, *target),
                    disp,
                    max: kind.map_or(0, BranchKind::max_disp),
                });
            }
            if let Some(word) = encode_branch(insn, disp) {
                output.extend_from_slice(&word.to_le_bytes());
            }
        }
        Instruction::Ordinary(bytes) => output.extend_from_slice(bytes),
        Instruction::Align { padding, .. } => emit_padding(output, at, *padding),
        Instruction::Trampoline { target, .. } => {
            let jump = at + u64::from(TRAMPOLINE_ENTRY);
            let disp = layout.label_offset(*target) as i64 - jump as i64;
            if !BranchKind::Unconditional.in_range(disp) {
                return Err(LayoutError::UnreachableTarget {
                    unit: program.name().into(),
                    label: program.labels().name(*target).into(),
                    disp,
                    max: BranchKind::Unconditional.max_disp(),
                });
            }
            output.extend_from_slice(&SKIP_TRAMPOLINE.to_le_bytes());
            output.extend_from_slice(&encode_b(false, disp).to_le_bytes());
        }
        Instruction::Label(_) => {}
    }
    Ok(())
}

/// Encode a converged program into its final bytes.
///
/// # Errors
///
/// See [`emit_instruction`].
pub fn emit(program: &Program, layout: &Layout) -> Result<Vec<u8>, LayoutError> {
    let mut output = Vec::with_capacity(layout.size() as usize);
    for index in 0..program.len() {
        emit_instruction(program, layout, index, &mut output)?;
    }
    debug_assert_eq!(output.len() as u64, layout.size());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn b_and_bl() {
        assert_eq!(encode_b(false, 0), 0x1400_0000);
        assert_eq!(encode_b(false, 8), 0x1400_0002);
        assert_eq!(encode_b(false, -4), 0x17FF_FFFF);
        assert_eq!(encode_b(true, 4), 0x9400_0001);
        assert_eq!(SKIP_TRAMPOLINE, encode_b(false, 8));
    }

    #[test]
    fn b_cond() {
        // b.eq .+8
        assert_eq!(encode_b_cond(Cond::Eq, 8), 0x5400_0040);
        // b.ne .-4
        assert_eq!(encode_b_cond(Cond::Ne, -4), 0x54FF_FFE1);
    }

    #[test]
    fn cbz_cbnz() {
        // cbz x0, .+8
        assert_eq!(encode_cbz(false, Register::x(0), 8), 0xB400_0040);
        // cbnz w1, .+8
        assert_eq!(encode_cbz(true, Register::w(1), 8), 0x3500_0041);
    }

    #[test]
    fn tbz_tbnz() {
        // tbnz x2, #5, .+8
        assert_eq!(encode_tbz(true, Register::x(2), 5, 8), 0x3728_0042);
        // tbz x3, #32, .+8
        assert_eq!(encode_tbz(false, Register::x(3), 32, 8), 0xB600_0043);
    }

    #[test]
    fn decode_recovers_displacement() {
        let cases = [
            (encode_b(false, -(1 << 27)), BranchKind::Unconditional, -(1i64 << 27)),
            (encode_b(true, (1 << 27) - 4), BranchKind::Unconditional, (1 << 27) - 4),
            (encode_b_cond(Cond::Lt, -(1 << 20)), BranchKind::Conditional, -(1 << 20)),
            (encode_cbz(true, Register::x(9), 1 << 16), BranchKind::Compare, 1 << 16),
            (encode_tbz(false, Register::w(4), 7, -32), BranchKind::TestBit, -32),
        ];
        for (word, kind, disp) in cases {
            assert_eq!(decode_branch(word), Some((kind, disp)), "{:#010x}", word);
        }
        assert_eq!(decode_branch(NOP), None);
    }

    #[test]
    fn add_and_ldst() {
        // add x16, x1, #0x8, lsl #12
        assert_eq!(encode_add_hi12(Register::x(16), Register::x(1), 0x8000), 0x9140_2030);
        // ldr x0, [x16, #8]
        assert_eq!(
            encode_ldst_uimm(AccessSize::Double, true, Register::x(0), Register::x(16), 1),
            0xF940_0600
        );
        // strb w2, [x3, #1]
        assert_eq!(
            encode_ldst_uimm(AccessSize::Byte, false, Register::w(2), Register::x(3), 1),
            0x3900_0462
        );
    }

    #[test]
    fn large_offset_pair() {
        let words = large_offset_access(
            AccessSize::Double,
            true,
            Register::x(0),
            Register::x(1),
            Register::x(16),
            0x8008,
        )
        .unwrap();
        assert_eq!(words, vec![0x9140_2030, 0xF940_0600]);

        // Fits the scaled field directly: single access.
        let words = large_offset_access(
            AccessSize::Word,
            false,
            Register::w(5),
            Register::x(6),
            Register::x(16),
            0x3ffc,
        )
        .unwrap();
        assert_eq!(words.len(), 1);

        assert_eq!(
            large_offset_access(
                AccessSize::Half,
                true,
                Register::w(0),
                Register::x(1),
                Register::x(16),
                0x1001,
            ),
            Err(SplitError::Misaligned {
                value: 0x1001,
                shift: 1
            })
        );
    }

    #[test]
    fn padding_bytes() {
        let mut out = Vec::new();
        emit_padding(&mut out, 10, 6);
        assert_eq!(out.len(), 6);
        assert_eq!(&out[..2], &[0, 0]);
        assert_eq!(&out[2..], &NOP.to_le_bytes());

        let mut out = Vec::new();
        emit_padding(&mut out, 4, 12);
        assert_eq!(out, [NOP.to_le_bytes(); 3].concat());
    }
}
