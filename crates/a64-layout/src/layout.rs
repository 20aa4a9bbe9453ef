//! Program-counter layout and alignment padding.
//!
//! A sweep is a single left-to-right fold over the stream: each instruction
//! gets the running offset, then the offset advances by the instruction's
//! size. Alignment directives are the only elements whose size is computed
//! here; their padding is the smallest non-negative amount that puts the next
//! instruction on the requested boundary.
//!
//! The end of an alignment directive is `ceil(offset / A) * A`, which never
//! decreases when `offset` grows. Together with trampolines only ever being
//! added, every offset is non-decreasing from one sweep to the next even
//! though an individual directive's padding may shrink.

use alloc::vec::Vec;

use crate::ir::{BranchTarget, Instruction, LabelId, Program, TrampolineId, TRAMPOLINE_ENTRY};

/// Padding needed to move `offset` up to a multiple of `alignment`.
///
/// `alignment` must be non-zero.
///
/// # Examples
///
/// ```
/// use a64_layout::layout::alignment_padding;
///
/// assert_eq!(alignment_padding(10, 16), 6);
/// assert_eq!(alignment_padding(32, 16), 0);
/// ```
#[must_use]
pub fn alignment_padding(offset: u64, alignment: u32) -> u32 {
    let a = u64::from(alignment);
    ((a - offset % a) % a) as u32
}

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Alignment directives whose padding differs from the previous sweep.
    pub padding_changes: usize,
}

/// Offsets assigned by the most recent sweep.
///
/// `offsets[i]` is the absolute offset of instruction `i`; a trailing sentinel
/// holds the end of the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Layout {
    base: u64,
    offsets: Vec<u64>,
    labels: Vec<u64>,
    trampolines: Vec<u64>,
}

impl Layout {
    /// An empty layout starting at `base`.
    #[must_use]
    pub fn new(base: u64) -> Self {
        Self {
            base,
            offsets: Vec::new(),
            labels: Vec::new(),
            trampolines: Vec::new(),
        }
    }

    /// Assign offsets to every instruction of `program` and recompute
    /// alignment padding. Instruction content is left untouched.
    ///
    /// Offsets are plain sums from `base`; [`relax`](crate::relax::relax)
    /// rejects bases for which they could overflow.
    pub fn sweep(&mut self, program: &mut Program) -> SweepStats {
        let mut stats = SweepStats::default();
        self.offsets.clear();
        self.offsets.reserve(program.len() + 1);
        self.labels.clear();
        self.labels.resize(program.labels().len(), self.base);
        self.trampolines.clear();
        self.trampolines.resize(program.trampoline_count(), self.base);

        let mut current = self.base;
        for insn in program.instructions_mut() {
            self.offsets.push(current);
            match insn {
                Instruction::Align { alignment, padding } => {
                    let wanted = alignment_padding(current, *alignment);
                    if wanted != *padding {
                        log::trace!(
                            "align {} at {:#x}: padding {} -> {}",
                            alignment,
                            current,
                            padding,
                            wanted
                        );
                        *padding = wanted;
                        stats.padding_changes += 1;
                    }
                }
                Instruction::Label(id) => self.labels[id.index()] = current,
                Instruction::Trampoline { id, .. } => self.trampolines[id.index()] = current,
                Instruction::Branch { .. }
                | Instruction::CondBranch { .. }
                | Instruction::CompareBranch { .. }
                | Instruction::TestBitBranch { .. }
                | Instruction::Ordinary(_) => {}
            }
            current += u64::from(insn.size());
        }
        self.offsets.push(current);
        stats
    }

    /// Base offset of the unit.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Offset of instruction `index`. `index == len` yields the end offset.
    #[must_use]
    pub fn offset(&self, index: usize) -> u64 {
        self.offsets[index]
    }

    /// Per-instruction offsets followed by the end sentinel.
    #[must_use]
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Offset just past the last instruction.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(self.base)
    }

    /// Total bytes occupied by the unit.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end() - self.base
    }

    /// Offset a label resolves to.
    #[must_use]
    pub fn label_offset(&self, id: LabelId) -> u64 {
        self.labels[id.index()]
    }

    /// Offset of a trampoline block's first word.
    #[must_use]
    pub fn trampoline_offset(&self, id: TrampolineId) -> u64 {
        self.trampolines[id.index()]
    }

    /// Offset a branch to `target` lands on.
    #[must_use]
    pub fn target_offset(&self, target: BranchTarget) -> u64 {
        match target {
            BranchTarget::Label(id) => self.label_offset(id),
            BranchTarget::Trampoline(id) => {
                self.trampoline_offset(id) + u64::from(TRAMPOLINE_ENTRY)
            }
        }
    }
}
