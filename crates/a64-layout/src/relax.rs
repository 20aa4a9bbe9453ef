//! Branch relaxation: trampoline insertion driven to a fixed point.
//!
//! After every layout sweep each PC-relative branch is checked against the
//! range of its field. A test-bit, compare, or conditional branch that cannot
//! reach its label gets a trampoline inserted directly behind it:
//!
//! ```text
//! cbz  x0, 1f          ; retargeted from `far`, always in range
//! b    2f              ; fall-through path skips the block
//! 1: b far             ; 26-bit reach
//! 2: ...
//! ```
//!
//! Insertion shifts every later offset, which can push a previously valid
//! branch out of range, so the unit is swept again until nothing changes.
//! Each relaxable branch is retargeted at most once (its trampoline sits
//! right behind it), hence at most `relaxable_branches + 1` sweeps are ever
//! needed. The cap turns anything beyond that into [`LayoutError::RelaxationLimit`].

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::LayoutError;
use crate::ir::{BranchKind, BranchTarget, Instruction, Program, INSN_SIZE, TRAMPOLINE_ENTRY};
use crate::layout::Layout;

/// Result of driving a unit to its fixed point.
#[derive(Debug, Clone)]
pub struct Relaxed {
    /// Offsets from the final (converged) sweep.
    pub layout: Layout,
    /// Sweeps executed, including the final one that changed nothing.
    pub sweeps: usize,
    /// Trampolines inserted during this call.
    pub inserted: usize,
}

/// Sweep cap used when none is configured.
#[must_use]
pub fn default_sweep_cap(program: &Program) -> usize {
    program.relaxable_branch_count() + 2
}

/// Lay out `program` from `base`, inserting trampolines until every branch
/// reaches its target.
///
/// Running this on an already converged program performs one sweep and no
/// mutation.
///
/// # Errors
///
/// - [`LayoutError::UnreachableTarget`] when an unconditional branch or a
///   trampoline's jump exceeds ±128 MiB and no relaxation is left to do.
/// - [`LayoutError::UnalignedBranch`] when a branch or its target is not on a
///   word boundary.
/// - [`LayoutError::AddressOverflow`] when `base` plus the largest size the
///   unit can grow to passes `i64::MAX`.
/// - [`LayoutError::RelaxationLimit`] when `max_sweeps` sweeps (default
///   [`default_sweep_cap`]) pass without convergence.
pub fn relax(
    program: &mut Program,
    base: u64,
    max_sweeps: Option<usize>,
) -> Result<Relaxed, LayoutError> {
    let cap = max_sweeps.unwrap_or_else(|| default_sweep_cap(program));
    let mut layout = Layout::new(base);
    let mut pending: Vec<usize> = Vec::new();
    let mut inserted = 0;

    check_address_space(program, base)?;

    for sweep in 1..=cap {
        let stats = layout.sweep(program);
        pending.clear();
        let blocked = find_out_of_range(program, &layout, &mut pending)?;

        log::debug!(
            "{}: sweep {}: size {:#x}, {} out of range, {} padding changes",
            program.name(),
            sweep,
            layout.size(),
            pending.len(),
            stats.padding_changes
        );

        if pending.is_empty() {
            // Nothing left to relax, so nothing can move the target closer.
            if let Some(err) = blocked {
                return Err(err);
            }
            log::debug!(
                "{}: converged after {} sweep{} with {} trampoline{}",
                program.name(),
                sweep,
                if sweep == 1 { "" } else { "s" },
                program.trampoline_count(),
                if program.trampoline_count() == 1 { "" } else { "s" }
            );
            return Ok(Relaxed {
                layout,
                sweeps: sweep,
                inserted,
            });
        }

        // Back to front so earlier indices stay valid.
        for &index in pending.iter().rev() {
            if let Some(BranchTarget::Label(target)) = program.instructions()[index].target() {
                let id = program.insert_trampoline(index, target);
                log::trace!(
                    "{}: branch at {:#x} to '{}' relaxed via trampoline #{}",
                    program.name(),
                    layout.offset(index),
                    program.labels().name(target),
                    id.index()
                );
                inserted += 1;
            }
        }
    }

    Err(LayoutError::RelaxationLimit {
        unit: program.name().to_string(),
        sweeps: cap,
    })
}

/// Collect indices of relaxable branches that miss their label.
///
/// The first unconditional jump (plain `B`/`BL` or a trampoline's jump) that
/// misses is returned rather than raised: trampolines queued in the same
/// sweep can still pull it back into range when an alignment directive
/// between the jump and its target absorbs the inserted bytes.
fn find_out_of_range(
    program: &Program,
    layout: &Layout,
    out: &mut Vec<usize>,
) -> Result<Option<LayoutError>, LayoutError> {
    let mut first_unreachable = None;
    for (index, insn) in program.instructions().iter().enumerate() {
        let from = layout.offset(index);
        match insn {
            Instruction::Branch { target, .. }
            | Instruction::CondBranch { target, .. }
            | Instruction::CompareBranch { target, .. }
            | Instruction::TestBitBranch { target, .. } => {
                let Some(kind) = insn.branch_kind() else {
                    continue;
                };
                let to = layout.target_offset(*target);
                let disp = check_aligned(program, *target, from, to)?;
                if kind.in_range(disp) {
                    continue;
                }
                match target {
                    BranchTarget::Label(_) if kind.is_relaxable() => out.push(index),
                    _ => {
                        first_unreachable
                            .get_or_insert_with(|| unreachable(program, *target, disp));
                    }
                }
            }
            Instruction::Trampoline { target, .. } => {
                let jump = from + u64::from(TRAMPOLINE_ENTRY);
                let to = layout.label_offset(*target);
                let label = BranchTarget::Label(*target);
                let disp = check_aligned(program, label, jump, to)?;
                if !BranchKind::Unconditional.in_range(disp) {
                    first_unreachable.get_or_insert_with(|| unreachable(program, label, disp));
                }
            }
            Instruction::Ordinary(_) | Instruction::Align { .. } | Instruction::Label(_) => {}
        }
    }
    Ok(first_unreachable)
}

/// Reject units whose largest possible layout would not fit below
/// `i64::MAX`, where offsets stop being representable as signed
/// displacements.
fn check_address_space(program: &Program, base: u64) -> Result<(), LayoutError> {
    let size = program.max_size();
    match size.and_then(|size| base.checked_add(size)) {
        Some(end) if end <= i64::MAX as u64 => Ok(()),
        _ => Err(LayoutError::AddressOverflow {
            unit: program.name().to_string(),
            base,
            size: size.unwrap_or(u64::MAX),
        }),
    }
}

/// Signed displacement `to - from`, provided both ends are word aligned.
fn check_aligned(
    program: &Program,
    target: BranchTarget,
    from: u64,
    to: u64,
) -> Result<i64, LayoutError> {
    let word = u64::from(INSN_SIZE);
    if from % word != 0 || to % word != 0 {
        return Err(LayoutError::UnalignedBranch {
            unit: program.name().to_string(),
            label: target_name(program, target),
            offset: from,
            target: to,
        });
    }
    Ok(to as i64 - from as i64)
}

fn unreachable(program: &Program, target: BranchTarget, disp: i64) -> LayoutError {
    LayoutError::UnreachableTarget {
        unit: program.name().to_string(),
        label: target_name(program, target),
        disp,
        max: BranchKind::Unconditional.max_disp(),
    }
}

/// Human-readable name of a branch destination.
pub(crate) fn target_name(program: &Program, target: BranchTarget) -> String {
    match target {
        BranchTarget::Label(id) => program.labels().name(id).to_string(),
        BranchTarget::Trampoline(id) => format!("<trampoline {}>", id.index()),
    }
}
