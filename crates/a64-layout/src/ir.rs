//! Program model: instructions, branch kinds, and the label table.
//!
//! A [`Program`] is the ordered instruction stream of one compilation unit.
//! Labels are realised as zero-size [`Instruction::Label`] markers inside the
//! stream, so inserting trampolines never disturbs a label's binding: the
//! marker simply moves along with the instructions around it.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// Size of one A64 instruction word in bytes.
pub const INSN_SIZE: u32 = 4;

/// Size of a synthesized trampoline block: `B +8` followed by `B target`.
pub const TRAMPOLINE_SIZE: u32 = 2 * INSN_SIZE;

/// Offset of a trampoline's entry (the long jump) from the start of its block.
pub const TRAMPOLINE_ENTRY: u32 = INSN_SIZE;

// ─── Identifiers ───────────────────────────────────────────

/// Index into a unit's [`LabelTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelId(pub(crate) u32);

impl LabelId {
    /// Position in the label table.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity of a synthesized trampoline, stable across insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrampolineId(pub(crate) u32);

impl TrampolineId {
    /// Creation order of the trampoline within its unit.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ─── Registers and conditions ──────────────────────────────

/// A general-purpose register operand (`Xn` or `Wn`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Register {
    num: u8,
    wide: bool,
}

impl Register {
    /// 64-bit register `Xn`; `n` is masked to 0–31.
    #[must_use]
    pub const fn x(n: u8) -> Self {
        Self {
            num: n & 0x1F,
            wide: true,
        }
    }

    /// 32-bit register `Wn`; `n` is masked to 0–31.
    #[must_use]
    pub const fn w(n: u8) -> Self {
        Self {
            num: n & 0x1F,
            wide: false,
        }
    }

    /// Register number (31 is XZR/WZR or SP depending on the instruction).
    #[must_use]
    pub fn num(self) -> u32 {
        self.num as u32
    }

    /// Whether this is a 64-bit (`X`) register.
    #[must_use]
    pub fn is_64bit(self) -> bool {
        self.wide
    }

    /// The `sf` bit of data-processing and compare-and-branch encodings.
    pub(crate) fn sf(self) -> u32 {
        u32::from(self.wide)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.wide { 'x' } else { 'w' };
        if self.num == 31 {
            write!(f, "{}zr", prefix)
        } else {
            write!(f, "{}{}", prefix, self.num)
        }
    }
}

/// A64 condition codes for `B.cond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Cond {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Carry set / unsigned higher or same.
    Hs,
    /// Carry clear / unsigned lower.
    Lo,
    /// Minus / negative.
    Mi,
    /// Plus / positive or zero.
    Pl,
    /// Overflow.
    Vs,
    /// No overflow.
    Vc,
    /// Unsigned higher.
    Hi,
    /// Unsigned lower or same.
    Ls,
    /// Signed greater than or equal.
    Ge,
    /// Signed less than.
    Lt,
    /// Signed greater than.
    Gt,
    /// Signed less than or equal.
    Le,
    /// Always.
    Al,
    /// Always (encoding `0b1111`).
    Nv,
}

impl Cond {
    const ALL: [Cond; 16] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Hs,
        Cond::Lo,
        Cond::Mi,
        Cond::Pl,
        Cond::Vs,
        Cond::Vc,
        Cond::Hi,
        Cond::Ls,
        Cond::Ge,
        Cond::Lt,
        Cond::Gt,
        Cond::Le,
        Cond::Al,
        Cond::Nv,
    ];

    /// The 4-bit encoding.
    #[must_use]
    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Decode a 4-bit condition field.
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self::ALL[(bits & 0xF) as usize]
    }

    /// The opposite condition (EQ↔NE, HS↔LO, …).
    #[must_use]
    pub fn invert(self) -> Self {
        Self::from_bits(self.bits() ^ 1)
    }

    /// Lower-case mnemonic suffix.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Hs => "hs",
            Cond::Lo => "lo",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Vs => "vs",
            Cond::Vc => "vc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Al => "al",
            Cond::Nv => "nv",
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Branch kinds ──────────────────────────────────────────

/// The four PC-relative branch families and their displacement fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BranchKind {
    /// TBZ / TBNZ: 14-bit signed word offset, ±32 KiB.
    TestBit,
    /// CBZ / CBNZ: 19-bit signed word offset, ±1 MiB.
    Compare,
    /// B.cond: 19-bit signed word offset, ±1 MiB.
    Conditional,
    /// B / BL: 26-bit signed word offset, ±128 MiB.
    Unconditional,
}

impl BranchKind {
    /// Width of the signed word-offset field.
    #[must_use]
    pub fn field_bits(self) -> u32 {
        match self {
            BranchKind::TestBit => 14,
            BranchKind::Compare | BranchKind::Conditional => 19,
            BranchKind::Unconditional => 26,
        }
    }

    /// Most negative encodable byte displacement.
    #[must_use]
    pub fn min_disp(self) -> i64 {
        -(1i64 << (self.field_bits() - 1)) * INSN_SIZE as i64
    }

    /// Most positive encodable byte displacement.
    #[must_use]
    pub fn max_disp(self) -> i64 {
        ((1i64 << (self.field_bits() - 1)) - 1) * INSN_SIZE as i64
    }

    /// Whether `disp` (bytes, word aligned) fits the field.
    #[must_use]
    pub fn in_range(self, disp: i64) -> bool {
        (self.min_disp()..=self.max_disp()).contains(&disp)
    }

    /// Whether an out-of-range branch of this kind can be routed through a
    /// trampoline. Unconditional branches already have the longest reach.
    #[must_use]
    pub fn is_relaxable(self) -> bool {
        !matches!(self, BranchKind::Unconditional)
    }
}

/// Where a branch currently points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BranchTarget {
    /// A label from the unit's label table.
    Label(LabelId),
    /// The entry of a synthesized trampoline.
    Trampoline(TrampolineId),
}

// ─── Instruction payload ───────────────────────────────────

/// Encoded bytes of an ordinary instruction (or a pre-expanded sequence).
///
/// Single words are stored inline; longer payloads fall back to the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CodeBytes {
    /// One instruction word, little-endian.
    Word([u8; 4]),
    /// Any other payload (pseudo-instruction expansions, literal data).
    Heap(Vec<u8>),
}

impl CodeBytes {
    /// Wrap an already-encoded instruction word.
    #[must_use]
    pub fn word(word: u32) -> Self {
        CodeBytes::Word(word.to_le_bytes())
    }
}

impl core::ops::Deref for CodeBytes {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        match self {
            CodeBytes::Word(w) => w,
            CodeBytes::Heap(v) => v,
        }
    }
}

// ─── Instruction ───────────────────────────────────────────

/// One element of the instruction stream.
///
/// Every consumer matches exhaustively, so a new branch family has to be
/// handled by the layout solver, the relaxer, and the emitter alike.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instruction {
    /// `B label` or, with `link`, `BL label`.
    Branch {
        /// Call form (`BL`).
        link: bool,
        /// Branch destination.
        target: BranchTarget,
    },
    /// `B.cond label`.
    CondBranch {
        /// Condition tested.
        cond: Cond,
        /// Branch destination.
        target: BranchTarget,
    },
    /// `CBZ Rt, label` or, with `nonzero`, `CBNZ Rt, label`.
    CompareBranch {
        /// `CBNZ` rather than `CBZ`.
        nonzero: bool,
        /// Register compared against zero.
        rt: Register,
        /// Branch destination.
        target: BranchTarget,
    },
    /// `TBZ Rt, #bit, label` or, with `nonzero`, `TBNZ Rt, #bit, label`.
    TestBitBranch {
        /// `TBNZ` rather than `TBZ`.
        nonzero: bool,
        /// Register tested.
        rt: Register,
        /// Bit number, 0–63.
        bit: u8,
        /// Branch destination.
        target: BranchTarget,
    },
    /// Any instruction whose size and bytes are fixed by instruction selection.
    Ordinary(CodeBytes),
    /// Pad to an `alignment`-byte boundary. `padding` is derived by each sweep.
    Align {
        /// Requested power-of-two boundary.
        alignment: u32,
        /// Bytes inserted in the most recent sweep.
        padding: u32,
    },
    /// Synthesized `B +8; B target` block reached by a relaxed branch.
    Trampoline {
        /// Identity the relaxed branch points at.
        id: TrampolineId,
        /// The original branch's true destination.
        target: LabelId,
    },
    /// Zero-size marker binding a label to the next instruction.
    Label(LabelId),
}

impl Instruction {
    /// Current encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            Instruction::Branch { .. }
            | Instruction::CondBranch { .. }
            | Instruction::CompareBranch { .. }
            | Instruction::TestBitBranch { .. } => INSN_SIZE,
            Instruction::Ordinary(bytes) => bytes.len() as u32,
            Instruction::Align { padding, .. } => *padding,
            Instruction::Trampoline { .. } => TRAMPOLINE_SIZE,
            Instruction::Label(_) => 0,
        }
    }

    /// Branch family, for PC-relative branches.
    #[must_use]
    pub fn branch_kind(&self) -> Option<BranchKind> {
        match self {
            Instruction::Branch { .. } => Some(BranchKind::Unconditional),
            Instruction::CondBranch { .. } => Some(BranchKind::Conditional),
            Instruction::CompareBranch { .. } => Some(BranchKind::Compare),
            Instruction::TestBitBranch { .. } => Some(BranchKind::TestBit),
            Instruction::Ordinary(_)
            | Instruction::Align { .. }
            | Instruction::Trampoline { .. }
            | Instruction::Label(_) => None,
        }
    }

    /// Destination of a branch instruction.
    #[must_use]
    pub fn target(&self) -> Option<BranchTarget> {
        match self {
            Instruction::Branch { target, .. }
            | Instruction::CondBranch { target, .. }
            | Instruction::CompareBranch { target, .. }
            | Instruction::TestBitBranch { target, .. } => Some(*target),
            Instruction::Ordinary(_)
            | Instruction::Align { .. }
            | Instruction::Trampoline { .. }
            | Instruction::Label(_) => None,
        }
    }

    /// Point a branch at a new destination. Returns `false` for non-branches.
    pub(crate) fn retarget(&mut self, to: BranchTarget) -> bool {
        match self {
            Instruction::Branch { target, .. }
            | Instruction::CondBranch { target, .. }
            | Instruction::CompareBranch { target, .. }
            | Instruction::TestBitBranch { target, .. } => {
                *target = to;
                true
            }
            Instruction::Ordinary(_)
            | Instruction::Align { .. }
            | Instruction::Trampoline { .. }
            | Instruction::Label(_) => false,
        }
    }
}

// ─── Label table ───────────────────────────────────────────

/// Label names and where the front end bound them.
///
/// Built once while the unit is constructed; relaxation never changes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelTable {
    names: Vec<String>,
    by_name: BTreeMap<String, LabelId>,
    /// Input instruction index each label marks, once bound.
    bound_at: Vec<Option<usize>>,
}

impl LabelTable {
    /// Look up or create the id for `name`.
    pub(crate) fn intern(&mut self, name: &str) -> LabelId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = LabelId(self.names.len() as u32);
        self.names.push(String::from(name));
        self.by_name.insert(String::from(name), id);
        self.bound_at.push(None);
        id
    }

    /// Record that `id` marks input instruction `index`.
    ///
    /// Returns the earlier index if the label is already bound.
    pub(crate) fn bind(&mut self, id: LabelId, index: usize) -> Result<(), usize> {
        match self.bound_at[id.index()] {
            Some(first) => Err(first),
            None => {
                self.bound_at[id.index()] = Some(index);
                Ok(())
            }
        }
    }

    /// The label's name.
    #[must_use]
    pub fn name(&self, id: LabelId) -> &str {
        &self.names[id.index()]
    }

    /// Id for an existing label name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<LabelId> {
        self.by_name.get(name).copied()
    }

    /// Input instruction index the label marks, if bound.
    #[must_use]
    pub fn bound_at(&self, id: LabelId) -> Option<usize> {
        self.bound_at[id.index()]
    }

    /// Number of labels (bound or merely referenced).
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All label ids in creation order.
    pub fn ids(&self) -> impl Iterator<Item = LabelId> + '_ {
        (0..self.names.len() as u32).map(LabelId)
    }
}

// ─── Program ───────────────────────────────────────────────

/// The instruction stream of one compilation unit plus its label table.
///
/// Owned exclusively by whoever is laying it out. Relaxation only inserts
/// (never removes) instructions and only rewrites branch targets and
/// alignment padding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Program {
    name: String,
    instructions: Vec<Instruction>,
    labels: LabelTable,
    trampolines: u32,
}

impl Program {
    pub(crate) fn new(name: String, instructions: Vec<Instruction>, labels: LabelTable) -> Self {
        Self {
            name,
            instructions,
            labels,
            trampolines: 0,
        }
    }

    /// Unit name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instruction stream, label markers included.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub(crate) fn instructions_mut(&mut self) -> &mut [Instruction] {
        &mut self.instructions
    }

    /// Number of stream elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the stream is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The label table.
    #[must_use]
    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    /// Number of trampolines synthesized so far.
    #[must_use]
    pub fn trampoline_count(&self) -> usize {
        self.trampolines as usize
    }

    /// Number of branches that may need a trampoline.
    #[must_use]
    pub fn relaxable_branch_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|insn| insn.branch_kind().is_some_and(BranchKind::is_relaxable))
            .count()
    }

    /// Upper bound on the unit's size across every sweep: alignment
    /// directives at their widest and one trampoline per relaxable branch.
    ///
    /// `None` if the bound does not fit in a `u64`.
    #[must_use]
    pub fn max_size(&self) -> Option<u64> {
        let trampolines = (self.relaxable_branch_count() as u64)
            .checked_mul(u64::from(TRAMPOLINE_SIZE))?;
        self.instructions.iter().try_fold(trampolines, |total, insn| {
            let size = match insn {
                Instruction::Align { alignment, .. } => alignment.saturating_sub(1),
                _ => insn.size(),
            };
            total.checked_add(u64::from(size))
        })
    }

    /// Insert a trampoline to `target` right after instruction `after` and
    /// point that branch at it.
    pub(crate) fn insert_trampoline(&mut self, after: usize, target: LabelId) -> TrampolineId {
        let id = TrampolineId(self.trampolines);
        self.trampolines += 1;
        self.instructions[after].retarget(BranchTarget::Trampoline(id));
        self.instructions
            .insert(after + 1, Instruction::Trampoline { id, target });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use alloc::vec;

    #[test]
    fn branch_ranges() {
        assert_eq!(BranchKind::TestBit.max_disp(), (1 << 15) - 4);
        assert_eq!(BranchKind::TestBit.min_disp(), -(1 << 15));
        assert_eq!(BranchKind::Conditional.max_disp(), (1 << 20) - 4);
        assert_eq!(BranchKind::Compare.min_disp(), -(1 << 20));
        assert_eq!(BranchKind::Unconditional.max_disp(), (1 << 27) - 4);
        assert!(BranchKind::Conditional.in_range(-(1 << 20)));
        assert!(!BranchKind::Conditional.in_range(1 << 20));
        assert!(!BranchKind::Unconditional.is_relaxable());
    }

    #[test]
    fn cond_inversion() {
        assert_eq!(Cond::Eq.invert(), Cond::Ne);
        assert_eq!(Cond::Lt.invert(), Cond::Ge);
        assert_eq!(Cond::from_bits(0xB), Cond::Lt);
        assert_eq!(format!("{}", Cond::Hs), "hs");
    }

    #[test]
    fn register_display() {
        assert_eq!(format!("{}", Register::x(3)), "x3");
        assert_eq!(format!("{}", Register::w(31)), "wzr");
        assert_eq!(Register::x(40).num(), 8);
    }

    #[test]
    fn sizes() {
        let l = LabelId(0);
        assert_eq!(Instruction::Label(l).size(), 0);
        assert_eq!(Instruction::Ordinary(CodeBytes::word(0)).size(), 4);
        assert_eq!(Instruction::Ordinary(CodeBytes::Heap(vec![0; 10])).size(), 10);
        assert_eq!(
            Instruction::Trampoline {
                id: TrampolineId(0),
                target: l
            }
            .size(),
            TRAMPOLINE_SIZE
        );
        assert_eq!(
            Instruction::Align {
                alignment: 16,
                padding: 6
            }
            .size(),
            6
        );
    }

    #[test]
    fn label_table_binding() {
        let mut table = LabelTable::default();
        let a = table.intern("a");
        assert_eq!(table.intern("a"), a);
        assert_eq!(table.bound_at(a), None);
        assert_eq!(table.bind(a, 3), Ok(()));
        assert_eq!(table.bind(a, 5), Err(3));
        assert_eq!(table.bound_at(a), Some(3));
        assert_eq!(table.name(a), "a");
    }

    #[test]
    fn trampoline_insertion_retargets() {
        let mut labels = LabelTable::default();
        let t = labels.intern("t");
        let mut program = Program::new(
            "u".into(),
            vec![
                Instruction::CondBranch {
                    cond: Cond::Eq,
                    target: BranchTarget::Label(t),
                },
                Instruction::Label(t),
            ],
            labels,
        );
        let id = program.insert_trampoline(0, t);
        assert_eq!(program.len(), 3);
        assert_eq!(
            program.instructions()[0].target(),
            Some(BranchTarget::Trampoline(id))
        );
        assert_eq!(
            program.instructions()[1],
            Instruction::Trampoline { id, target: t }
        );
        assert_eq!(program.trampoline_count(), 1);
    }
}
