//! Regression tests for layout edge cases.
//!
//! Each test pins down one behaviour that is easy to get subtly wrong.

use a64_layout::encode::{decode_branch, SKIP_TRAMPOLINE};
use a64_layout::imm::split_imm24_scaled;
use a64_layout::{BranchKind, Cond, LayoutError, Register, UnitBuilder};

/// Regression: a label bound right after a relaxed branch must follow the
/// trampoline, so that the `B +8` fall-through lands exactly on it.
#[test]
fn label_after_relaxed_branch_follows_trampoline() {
    let mut unit = UnitBuilder::new("fallthrough");
    unit.cbz(Register::x(0), "far");
    unit.label("next").unwrap();
    unit.nop().bytes(&vec![0; 1 << 20]);
    unit.label("far").unwrap();

    let laid_out = unit.finish().unwrap();
    assert_eq!(laid_out.trampoline_count(), 1);
    let next = laid_out.label_offset("next").unwrap();
    assert_eq!(next, 12);

    let bytes = laid_out.emit().unwrap();
    assert_eq!(&bytes[4..8], &SKIP_TRAMPOLINE.to_le_bytes());
    // B +8 from offset 4 lands on `next`.
    assert_eq!(4 + 8, next);
}

/// Regression: the most negative displacement is encodable; only one word
/// further needs a trampoline.
#[test]
fn most_negative_displacement_is_in_range() {
    for (extra, trampolines) in [(0usize, 0usize), (4, 1)] {
        let mut unit = UnitBuilder::new("back");
        unit.label("top").unwrap();
        unit.bytes(&vec![0; (1 << 15) + extra]);
        unit.tbnz(Register::w(7), 2, "top");
        let laid_out = unit.finish().unwrap();
        assert_eq!(laid_out.trampoline_count(), trampolines, "extra {}", extra);
    }
}

/// Regression: padding before a directive can shrink after a trampoline is
/// inserted ahead of it; the instruction after the directive keeps its offset.
#[test]
fn padding_shrinks_to_absorb_trampoline() {
    let mut unit = UnitBuilder::new("absorb");
    unit.b_cond(Cond::Gt, "far").align(64);
    unit.label("aligned").unwrap();
    unit.bytes(&vec![0; 2 << 20]);
    unit.label("far").unwrap();

    let laid_out = unit.finish().unwrap();
    assert_eq!(laid_out.trampoline_count(), 1);
    assert_eq!(laid_out.label_offset("aligned"), Some(64));
    // 4 (b.gt) + 8 (trampoline) + 52 (padding)
    let padding: u32 = laid_out
        .instructions()
        .iter()
        .filter(|insn| matches!(insn, a64_layout::Instruction::Align { .. }))
        .map(a64_layout::Instruction::size)
        .sum();
    assert_eq!(padding, 52);
}

/// Regression: a label at the very end of the stream resolves to the end of
/// the unit rather than being dropped.
#[test]
fn trailing_label_resolves_to_end() {
    let mut unit = UnitBuilder::new("tail");
    unit.base_offset(0x100).nop().nop();
    unit.label("end").unwrap();
    let laid_out = unit.finish().unwrap();
    assert_eq!(laid_out.label_offset("end"), Some(0x108));
    assert_eq!(laid_out.base() + laid_out.size(), 0x108);
}

/// Regression: padding that starts mid-word zero-fills up to the word
/// boundary before emitting NOPs.
#[test]
fn padding_after_odd_payload() {
    let mut unit = UnitBuilder::new("odd");
    unit.bytes(&[1, 2, 3, 4, 5]).align(8).nop();
    let bytes = unit.finish().unwrap().emit().unwrap();
    assert_eq!(bytes.len(), 12);
    assert_eq!(&bytes[5..8], &[0, 0, 0]);
}

/// Regression: a branch placed after an odd-sized payload is rejected instead
/// of being encoded with a truncated displacement.
#[test]
fn branch_after_odd_payload_is_rejected() {
    let mut unit = UnitBuilder::new("misplaced");
    unit.bytes(&[0; 6]).b("t");
    unit.label("t").unwrap();
    assert_eq!(
        unit.finish().unwrap_err(),
        LayoutError::UnalignedBranch {
            unit: "misplaced".into(),
            label: "t".into(),
            offset: 6,
            target: 10,
        }
    );
}

/// Regression: when the natural high part overflows its field, the excess
/// moves into the low part instead of failing.
#[test]
fn split_clamps_high_part() {
    assert_eq!(split_imm24_scaled(0x1000ffe, 1), Ok((0xfff000, 0xfff)));
    assert_eq!(split_imm24_scaled(0x1006ff8, 3), Ok((0xfff000, 0xfff)));
    assert_eq!(split_imm24_scaled(0x10fe, 1), Ok((0x0, 0x87f)));
}

/// Regression: a trampoline reused across re-layout keeps its identity and
/// the relaxed branch is not relaxed a second time.
#[test]
fn relayout_does_not_stack_trampolines() {
    let mut unit = UnitBuilder::new("twice");
    unit.tbz(Register::x(5), 9, "far").bytes(&vec![0; 1 << 16]);
    unit.label("far").unwrap();
    let first = unit.finish().unwrap();
    let second = a64_layout::layout_unit(first.clone().into_program(), 0).unwrap();
    assert_eq!(second.trampoline_count(), 1);

    let bytes = second.emit().unwrap();
    let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    assert_eq!(decode_branch(word), Some((BranchKind::TestBit, 8)));
}
