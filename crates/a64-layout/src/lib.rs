//! # a64-layout: Fixed-Width A64 Code Layout
//!
//! `a64-layout` is the layout back end of an AArch64 assembler: it takes an
//! ordered instruction stream with symbolic branch targets and alignment
//! directives, assigns every instruction its final byte offset, and repairs
//! out-of-range branches with trampolines until a fixed point is reached.
//!
//! ## Quick Start
//!
//! ```rust
//! use a64_layout::{Cond, UnitBuilder};
//!
//! let mut unit = UnitBuilder::new("main");
//! unit.b_cond(Cond::Eq, "far");
//! unit.bytes(&vec![0; 2 << 20]); // 2 MiB: beyond B.cond's ±1 MiB
//! unit.label("far")?;
//!
//! let laid_out = unit.finish()?;
//! assert_eq!(laid_out.trampoline_count(), 1);
//! let code = laid_out.emit()?;
//! assert_eq!(code.len() as u64, laid_out.size());
//! # Ok::<(), a64_layout::LayoutError>(())
//! ```
//!
//! ## Features
//!
//! - **Branch relaxation**: TBZ/TBNZ, CBZ/CBNZ and B.cond that cannot reach
//!   their label are routed through a `B +8; B target` trampoline.
//! - **Alignment**: minimal padding against the absolute offset, emitted as NOPs.
//! - **Scaled immediates**: [`imm::split_imm24_scaled`] for `ADD #hi` +
//!   `LDR/STR #lo` sequences.
//! - **`no_std` + `alloc`**: disable the default `std` feature.
//! - **`parallel`**: lay out independent units on a rayon pool.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// Offsets, displacements and encoding fields move between u64, i64 and u32
// constantly, and encodings are written as dense hex literals.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::fn_params_excessive_bools,
    clippy::missing_errors_doc,
    clippy::return_self_not_must_use
)]

extern crate alloc;

/// A64 word encoders and byte emission.
pub mod encode;
/// Error types for immediate splitting and unit layout.
pub mod error;
/// Scaled 24-bit immediate splitting.
pub mod imm;
/// Program model: instructions, labels, branch kinds.
pub mod ir;
/// Offset assignment and alignment padding.
pub mod layout;
/// Branch relaxation driven to a fixed point.
pub mod relax;
/// Unit builder, resource limits, and converged units.
pub mod unit;

// Re-exports
pub use error::{LayoutError, SplitError};
pub use imm::{split_imm24_scaled, AccessSize};
pub use ir::{
    BranchKind, BranchTarget, CodeBytes, Cond, Instruction, LabelId, LabelTable, Program,
    Register, TrampolineId,
};
pub use layout::Layout;
pub use unit::{LaidOutUnit, ResourceLimits, UnitBuilder};

use alloc::vec::Vec;

/// Lay out one program starting at `base` with default limits.
///
/// # Errors
///
/// Returns [`LayoutError`] if the program is invalid or cannot converge.
///
/// # Examples
///
/// ```rust
/// use a64_layout::{layout_unit, UnitBuilder};
///
/// let mut unit = UnitBuilder::new("f");
/// unit.nop().align(16).label("aligned")?;
/// let program = unit.into_program()?;
///
/// let laid_out = layout_unit(program, 0x1004)?;
/// assert_eq!(laid_out.label_offset("aligned"), Some(0x1010));
/// # Ok::<(), a64_layout::LayoutError>(())
/// ```
pub fn layout_unit(program: Program, base: u64) -> Result<LaidOutUnit, LayoutError> {
    LaidOutUnit::new(program, base, &ResourceLimits::default())
}

/// Lay out independent units, one result per input in input order.
///
/// Units share nothing, so with the `parallel` feature they are processed on
/// the rayon thread pool; otherwise sequentially. A failing unit does not
/// affect the others.
///
/// # Examples
///
/// ```rust
/// use a64_layout::{layout_units, ResourceLimits, UnitBuilder};
///
/// let mut ok = UnitBuilder::new("ok");
/// ok.nop();
/// let mut bad = UnitBuilder::new("bad");
/// bad.b("missing");
///
/// let units = vec![(ok.into_program()?, 0), (bad.into_program_unchecked(), 0)];
/// let results = layout_units(units, &ResourceLimits::default());
/// assert!(results[0].is_ok());
/// assert!(results[1].is_err());
/// # Ok::<(), a64_layout::LayoutError>(())
/// ```
pub fn layout_units(
    units: Vec<(Program, u64)>,
    limits: &ResourceLimits,
) -> Vec<Result<LaidOutUnit, LayoutError>> {
    log::debug!("laying out {} units", units.len());

    #[cfg(feature = "parallel")]
    let results = {
        use rayon::prelude::*;
        units
            .into_par_iter()
            .map(|(program, base)| LaidOutUnit::new(program, base, limits))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let results = units
        .into_iter()
        .map(|(program, base)| LaidOutUnit::new(program, base, limits))
        .collect();

    results
}
