//! Unit builder API and the converged layout it produces.
//!
//! [`UnitBuilder`] collects one compilation unit's instruction stream and
//! label bindings. [`UnitBuilder::finish`] validates the stream, drives it to
//! a fixed point, and returns a [`LaidOutUnit`], which is immutable from then
//! on and can be shared freely with the encoding stage.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::encode;
use crate::error::LayoutError;
use crate::ir::{
    BranchTarget, CodeBytes, Cond, Instruction, LabelId, LabelTable, Program, Register, INSN_SIZE,
};
use crate::layout::Layout;
use crate::relax::{self, target_name};

/// Smallest accepted alignment directive (one instruction word).
pub const MIN_ALIGNMENT: u32 = INSN_SIZE;

/// Largest accepted alignment directive.
pub const MAX_ALIGNMENT: u32 = 2048;

/// Configurable limits for units built from untrusted input.
///
/// # Examples
///
/// ```rust
/// use a64_layout::{ResourceLimits, UnitBuilder};
///
/// let mut unit = UnitBuilder::new("small");
/// unit.limits(ResourceLimits {
///     max_instructions: 2,
///     ..ResourceLimits::default()
/// });
/// unit.nop().nop().nop();
/// assert!(unit.finish().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceLimits {
    /// Maximum number of stream elements, label markers included.
    /// Default: 1,000,000.
    pub max_instructions: usize,
    /// Maximum number of distinct labels (bound or referenced). Default: 100,000.
    pub max_labels: usize,
    /// Sweep cap for relaxation. `None` derives it from the number of
    /// relaxable branches, which is always sufficient.
    pub max_sweeps: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_labels: 100_000,
            max_sweeps: None,
        }
    }
}

/// Builder for one compilation unit.
///
/// # Examples
///
/// ```rust
/// use a64_layout::{Cond, UnitBuilder};
///
/// let mut unit = UnitBuilder::new("loop");
/// unit.label("top")?;
/// unit.nop().b_cond(Cond::Ne, "top").b("done");
/// unit.align(16).label("done")?;
/// let laid_out = unit.finish()?;
/// assert_eq!(laid_out.label_offset("done"), Some(16));
/// # Ok::<(), a64_layout::LayoutError>(())
/// ```
#[derive(Debug, Clone)]
pub struct UnitBuilder {
    name: String,
    base: u64,
    limits: ResourceLimits,
    instructions: Vec<Instruction>,
    labels: LabelTable,
}

impl UnitBuilder {
    /// Start an empty unit. `name` appears in every diagnostic.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base: 0,
            limits: ResourceLimits::default(),
            instructions: Vec::new(),
            labels: LabelTable::default(),
        }
    }

    /// Set the absolute offset of the unit's first byte (default 0).
    ///
    /// Alignment directives are evaluated against `base + running offset`.
    pub fn base_offset(&mut self, base: u64) -> &mut Self {
        self.base = base;
        self
    }

    /// Set resource limits. See [`ResourceLimits`] for the defaults.
    pub fn limits(&mut self, limits: ResourceLimits) -> &mut Self {
        self.limits = limits;
        self
    }

    /// Bind `name` to the next instruction.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::DuplicateLabel`] if the label is already bound,
    /// or [`LayoutError::ResourceLimitExceeded`] if the label limit is reached.
    pub fn label(&mut self, name: &str) -> Result<&mut Self, LayoutError> {
        if self.labels.get(name).is_none() && self.labels.len() >= self.limits.max_labels {
            return Err(self.label_limit());
        }
        let id = self.labels.intern(name);
        let index = self.instructions.len();
        if let Err(first_index) = self.labels.bind(id, index) {
            return Err(LayoutError::DuplicateLabel {
                unit: self.name.clone(),
                label: name.to_string(),
                index,
                first_index,
            });
        }
        self.instructions.push(Instruction::Label(id));
        Ok(self)
    }

    /// `B label`.
    pub fn b(&mut self, label: &str) -> &mut Self {
        let target = self.target(label);
        self.push(Instruction::Branch {
            link: false,
            target,
        })
    }

    /// `BL label`.
    pub fn bl(&mut self, label: &str) -> &mut Self {
        let target = self.target(label);
        self.push(Instruction::Branch { link: true, target })
    }

    /// `B.cond label`.
    pub fn b_cond(&mut self, cond: Cond, label: &str) -> &mut Self {
        let target = self.target(label);
        self.push(Instruction::CondBranch { cond, target })
    }

    /// `CBZ rt, label`.
    pub fn cbz(&mut self, rt: Register, label: &str) -> &mut Self {
        let target = self.target(label);
        self.push(Instruction::CompareBranch {
            nonzero: false,
            rt,
            target,
        })
    }

    /// `CBNZ rt, label`.
    pub fn cbnz(&mut self, rt: Register, label: &str) -> &mut Self {
        let target = self.target(label);
        self.push(Instruction::CompareBranch {
            nonzero: true,
            rt,
            target,
        })
    }

    /// `TBZ rt, #bit, label`. `bit` is masked to 0–63.
    pub fn tbz(&mut self, rt: Register, bit: u8, label: &str) -> &mut Self {
        let target = self.target(label);
        self.push(Instruction::TestBitBranch {
            nonzero: false,
            rt,
            bit: bit & 0x3F,
            target,
        })
    }

    /// `TBNZ rt, #bit, label`. `bit` is masked to 0–63.
    pub fn tbnz(&mut self, rt: Register, bit: u8, label: &str) -> &mut Self {
        let target = self.target(label);
        self.push(Instruction::TestBitBranch {
            nonzero: true,
            rt,
            bit: bit & 0x3F,
            target,
        })
    }

    /// An already-encoded instruction word.
    pub fn word(&mut self, word: u32) -> &mut Self {
        self.push(Instruction::Ordinary(CodeBytes::word(word)))
    }

    /// `NOP`.
    pub fn nop(&mut self) -> &mut Self {
        self.word(encode::NOP)
    }

    /// A fixed-size payload (an expanded pseudo-instruction or literal data).
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.push(Instruction::Ordinary(CodeBytes::Heap(bytes.to_vec())))
    }

    /// Pad so the next instruction starts on an `alignment`-byte boundary.
    ///
    /// The argument is checked by [`finish`](Self::finish): it must be a
    /// power of two in `[MIN_ALIGNMENT, MAX_ALIGNMENT]`.
    pub fn align(&mut self, alignment: u32) -> &mut Self {
        self.push(Instruction::Align {
            alignment,
            padding: 0,
        })
    }

    /// Append any stream element.
    ///
    /// Label markers should go through [`label`](Self::label) so that
    /// bindings are recorded.
    pub fn push(&mut self, insn: Instruction) -> &mut Self {
        self.instructions.push(insn);
        self
    }

    /// Number of stream elements so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether nothing has been added yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Validate the stream and hand it over as a [`Program`] without laying it out.
    ///
    /// # Errors
    ///
    /// Same validation failures as [`finish`](Self::finish).
    pub fn into_program(self) -> Result<Program, LayoutError> {
        let limits = self.limits;
        let program = self.into_program_unchecked();
        validate(&program, &limits)?;
        Ok(program)
    }

    /// Hand the stream over as a [`Program`] as is. Validation happens when
    /// it is laid out.
    pub fn into_program_unchecked(self) -> Program {
        Program::new(self.name, self.instructions, self.labels)
    }

    /// Validate, relax, and lay out the unit.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] for an undefined or duplicate label, an invalid
    /// alignment, an exceeded resource limit, an unreachable or unaligned
    /// branch, or non-convergence.
    pub fn finish(self) -> Result<LaidOutUnit, LayoutError> {
        let base = self.base;
        let limits = self.limits;
        let program = self.into_program()?;
        LaidOutUnit::new(program, base, &limits)
    }

    fn target(&mut self, label: &str) -> BranchTarget {
        BranchTarget::Label(self.labels.intern(label))
    }

    fn label_limit(&self) -> LayoutError {
        LayoutError::ResourceLimitExceeded {
            unit: self.name.clone(),
            resource: String::from("labels"),
            limit: self.limits.max_labels,
        }
    }
}

/// Check a program before layout: limits, label markers, alignment arguments,
/// and that every branch target exists.
///
/// Programs can also arrive deserialized, so nothing recorded in the label
/// table is trusted; markers in the stream are authoritative.
pub(crate) fn validate(program: &Program, limits: &ResourceLimits) -> Result<(), LayoutError> {
    let unit = || program.name().to_string();

    if program.len() > limits.max_instructions {
        return Err(LayoutError::ResourceLimitExceeded {
            unit: unit(),
            resource: String::from("instructions"),
            limit: limits.max_instructions,
        });
    }
    if program.labels().len() > limits.max_labels {
        return Err(LayoutError::ResourceLimitExceeded {
            unit: unit(),
            resource: String::from("labels"),
            limit: limits.max_labels,
        });
    }

    let label_count = program.labels().len();
    let mut marker_at: Vec<Option<usize>> = vec![None; label_count];
    for (index, insn) in program.instructions().iter().enumerate() {
        match insn {
            Instruction::Label(id) => {
                let slot = marker_at.get_mut(id.index()).ok_or_else(|| unknown_label(program, *id))?;
                if let Some(first_index) = *slot {
                    return Err(LayoutError::DuplicateLabel {
                        unit: unit(),
                        label: program.labels().name(*id).to_string(),
                        index,
                        first_index,
                    });
                }
                *slot = Some(index);
            }
            Instruction::Align { alignment, .. } => {
                let valid = alignment.is_power_of_two()
                    && (MIN_ALIGNMENT..=MAX_ALIGNMENT).contains(alignment);
                if !valid {
                    return Err(LayoutError::InvalidAlignment {
                        unit: unit(),
                        alignment: *alignment,
                        index,
                    });
                }
            }
            Instruction::Branch { .. }
            | Instruction::CondBranch { .. }
            | Instruction::CompareBranch { .. }
            | Instruction::TestBitBranch { .. }
            | Instruction::Ordinary(_)
            | Instruction::Trampoline { .. } => {}
        }
    }

    let trampolines = program.trampoline_count();
    for insn in program.instructions() {
        let (label, trampoline) = match insn {
            Instruction::Trampoline { id, target } => (Some(*target), Some(id.index())),
            _ => match insn.target() {
                Some(BranchTarget::Label(id)) => (Some(id), None),
                Some(BranchTarget::Trampoline(id)) => (None, Some(id.index())),
                None => (None, None),
            },
        };
        if let Some(id) = label {
            match marker_at.get(id.index()) {
                Some(Some(_)) => {}
                Some(None) => {
                    return Err(LayoutError::UndefinedLabel {
                        unit: unit(),
                        label: program.labels().name(id).to_string(),
                    })
                }
                None => return Err(unknown_label(program, id)),
            }
        }
        if let Some(index) = trampoline {
            if index >= trampolines {
                return Err(LayoutError::UndefinedLabel {
                    unit: unit(),
                    label: format!("<trampoline {}>", index),
                });
            }
        }
    }

    Ok(())
}

fn unknown_label(program: &Program, id: LabelId) -> LayoutError {
    LayoutError::UndefinedLabel {
        unit: program.name().to_string(),
        label: format!("#{}", id.index()),
    }
}

/// A unit whose layout has converged.
///
/// Every branch reaches its target, every alignment directive is satisfied,
/// and offsets are final. The value is read-only; wrap it in an `Arc` to hand
/// it to several consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[must_use]
pub struct LaidOutUnit {
    program: Program,
    layout: Layout,
    /// Label name → absolute offset, in label-table order.
    labels: Vec<(String, u64)>,
    sweeps: usize,
}

impl LaidOutUnit {
    /// Validate and relax `program` starting at `base`.
    ///
    /// # Errors
    ///
    /// See [`UnitBuilder::finish`].
    pub fn new(
        mut program: Program,
        base: u64,
        limits: &ResourceLimits,
    ) -> Result<Self, LayoutError> {
        validate(&program, limits)?;
        let relaxed = relax::relax(&mut program, base, limits.max_sweeps)?;
        let labels = program
            .labels()
            .ids()
            .map(|id| {
                (
                    program.labels().name(id).to_string(),
                    relaxed.layout.label_offset(id),
                )
            })
            .collect();
        Ok(Self {
            program,
            layout: relaxed.layout,
            labels,
            sweeps: relaxed.sweeps,
        })
    }

    /// Unit name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.program.name()
    }

    /// The final program, trampolines and padding included.
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The final instruction stream.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        self.program.instructions()
    }

    /// The converged offsets.
    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Absolute offset of instruction `index`.
    #[must_use]
    pub fn offset(&self, index: usize) -> u64 {
        self.layout.offset(index)
    }

    /// Absolute offset of the unit's first byte.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.layout.base()
    }

    /// Total size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.layout.size()
    }

    /// Resolved labels as `(name, absolute offset)` pairs.
    #[must_use]
    pub fn labels(&self) -> &[(String, u64)] {
        &self.labels
    }

    /// Resolved offset of a label by name.
    ///
    /// ```rust
    /// use a64_layout::UnitBuilder;
    ///
    /// let mut unit = UnitBuilder::new("f");
    /// unit.base_offset(0x1000).nop().label("after")?;
    /// let laid_out = unit.finish()?;
    /// assert_eq!(laid_out.label_offset("after"), Some(0x1004));
    /// assert_eq!(laid_out.label_offset("missing"), None);
    /// # Ok::<(), a64_layout::LayoutError>(())
    /// ```
    #[must_use]
    pub fn label_offset(&self, name: &str) -> Option<u64> {
        self.program
            .labels()
            .get(name)
            .map(|id| self.layout.label_offset(id))
    }

    /// Sweeps needed to converge, including the final one.
    #[must_use]
    pub fn sweeps(&self) -> usize {
        self.sweeps
    }

    /// Trampolines present in the final program.
    #[must_use]
    pub fn trampoline_count(&self) -> usize {
        self.program.trampoline_count()
    }

    /// Boundary the unit must be placed on for its alignment directives to
    /// hold: the largest directive, and never less than one word.
    #[must_use]
    pub fn required_alignment(&self) -> u32 {
        self.program
            .instructions()
            .iter()
            .filter_map(|insn| match insn {
                Instruction::Align { alignment, .. } => Some(*alignment),
                _ => None,
            })
            .fold(INSN_SIZE, u32::max)
    }

    /// Encode the unit into little-endian bytes.
    ///
    /// # Errors
    ///
    /// Cannot fail for a unit produced by [`LaidOutUnit::new`]; the `Result`
    /// covers deserialized units whose layout no longer matches the program.
    pub fn emit(&self) -> Result<Vec<u8>, LayoutError> {
        encode::emit(&self.program, &self.layout)
    }

    /// Give back the program, e.g. to re-run layout at another base.
    #[must_use]
    pub fn into_program(self) -> Program {
        self.program
    }

    /// Human-readable listing: offset, encoded bytes (up to 8), and a
    /// mnemonic view of every element including labels, padding, and
    /// trampolines.
    ///
    /// ```text
    /// 00000000                  entry:
    /// 00000000  41000054          b.ne <trampoline 0>
    /// 00000004  0200001401000014  b .+8; b far  // trampoline 0
    /// ```
    #[must_use]
    pub fn listing(&self) -> String {
        use core::fmt::Write;

        let mut out = String::new();
        let mut scratch = Vec::new();

        for (index, insn) in self.program.instructions().iter().enumerate() {
            let offset = self.layout.offset(index);
            if let Instruction::Label(id) = insn {
                let _ = writeln!(
                    out,
                    "{:08X}                  {}:",
                    offset,
                    self.program.labels().name(*id)
                );
                continue;
            }

            scratch.clear();
            if encode::emit_instruction(&self.program, &self.layout, index, &mut scratch).is_err() {
                scratch.clear();
            }
            let hex = scratch
                .iter()
                .take(8)
                .fold(String::new(), |mut acc, b| {
                    let _ = write!(acc, "{:02X}", b);
                    acc
                });
            let _ = writeln!(out, "{:08X}  {:<16}  {}", offset, hex, self.mnemonic(insn));
        }

        out
    }

    fn mnemonic(&self, insn: &Instruction) -> String {
        let program = &self.program;
        match insn {
            Instruction::Branch { link, target } => {
                let op = if *link { "bl" } else { "b" };
                format!("{} {}", op, target_name(program, *target))
            }
            Instruction::CondBranch { cond, target } => {
                format!("b.{} {}", cond, target_name(program, *target))
            }
            Instruction::CompareBranch {
                nonzero,
                rt,
                target,
            } => {
                let op = if *nonzero { "cbnz" } else { "cbz" };
                format!("{} {}, {}", op, rt, target_name(program, *target))
            }
            Instruction::TestBitBranch {
                nonzero,
                rt,
                bit,
                target,
            } => {
                let op = if *nonzero { "tbnz" } else { "tbz" };
                format!("{} {}, #{}, {}", op, rt, bit, target_name(program, *target))
            }
            Instruction::Ordinary(CodeBytes::Word(bytes)) => {
                format!(".inst {:#010x}", u32::from_le_bytes(*bytes))
            }
            Instruction::Ordinary(CodeBytes::Heap(bytes)) => {
                format!(".bytes {}", bytes.len())
            }
            Instruction::Align { alignment, padding } => {
                format!(".balign {}  // {} bytes padding", alignment, padding)
            }
            Instruction::Trampoline { id, target } => format!(
                "b .+8; b {}  // trampoline {}",
                program.labels().name(*target),
                id.index()
            ),
            Instruction::Label(id) => format!("{}:", program.labels().name(*id)),
        }
    }
}
