//! Error types for immediate splitting and unit layout.

use alloc::string::String;

use thiserror::Error;

/// Failure to decompose an offset into a `(hi, lo)` pair.
///
/// Reported to the caller of [`split_imm24_scaled`](crate::imm::split_imm24_scaled);
/// the encoder that asked decides whether the instruction is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SplitError {
    /// The value has bits below the scale that `lo << shift` cannot reproduce.
    #[error("{value:#x} is not a multiple of {}", 1u32 << .shift)]
    Misaligned {
        /// The rejected value.
        value: u32,
        /// Scale shift requested by the caller.
        shift: u32,
    },

    /// The high part would need more than a 12-bit field shifted by 12.
    #[error("{value:#x} is too large for a scaled 24-bit unsigned immediate (max {max:#x})")]
    OutOfRange {
        /// The rejected value.
        value: u32,
        /// Largest value accepted for this shift.
        max: u32,
    },

    /// The shift is not one of the four A64 access scales.
    #[error("scale shift {shift} is not in 0..=3")]
    InvalidShift {
        /// The rejected shift.
        shift: u32,
    },
}

/// Unit-level layout failure.
///
/// A unit either reaches a fully converged layout or fails with one of these;
/// there is no partial result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LayoutError {
    /// A branch references a label that was never bound.
    #[error("{unit}: undefined label '{label}'")]
    UndefinedLabel {
        /// Unit being laid out.
        unit: String,
        /// The unbound label name.
        label: String,
    },

    /// A label was bound twice.
    #[error("{unit}: duplicate label '{label}' at instruction {index} (first bound at {first_index})")]
    DuplicateLabel {
        /// Unit being laid out.
        unit: String,
        /// The label name.
        label: String,
        /// Input instruction index of the second binding.
        index: usize,
        /// Input instruction index of the first binding.
        first_index: usize,
    },

    /// An alignment directive asked for something other than a power of two in `[4, 2048]`.
    #[error("{unit}: alignment {alignment} at instruction {index} must be a power of two in [4, 2048]")]
    InvalidAlignment {
        /// Unit being laid out.
        unit: String,
        /// The requested alignment.
        alignment: u32,
        /// Input instruction index of the directive.
        index: usize,
    },

    /// A branch or its target does not sit on an instruction-word boundary.
    #[error("{unit}: branch at {offset:#x} to '{label}' at {target:#x} is not word aligned")]
    UnalignedBranch {
        /// Unit being laid out.
        unit: String,
        /// Target label name.
        label: String,
        /// Byte offset of the branch.
        offset: u64,
        /// Byte offset of the target.
        target: u64,
    },

    /// The target is beyond the reach of an unconditional branch, so no
    /// trampoline can repair it.
    #[error("{unit}: branch target '{label}' unreachable (displacement={disp}, max=±{max})")]
    UnreachableTarget {
        /// Unit being laid out.
        unit: String,
        /// Target label name.
        label: String,
        /// Byte displacement that could not be encoded.
        disp: i64,
        /// Largest encodable positive displacement.
        max: i64,
    },

    /// Offsets of the unit could pass `i64::MAX` and no longer yield signed
    /// branch displacements.
    #[error("{unit}: unit of up to {size:#x} bytes does not fit at base {base:#x}")]
    AddressOverflow {
        /// Unit being laid out.
        unit: String,
        /// Requested base offset.
        base: u64,
        /// Largest size the unit can grow to during relaxation.
        size: u64,
    },

    /// The sweep loop hit its cap without reaching a fixed point.
    #[error("{unit}: layout did not converge after {sweeps} sweeps (internal error)")]
    RelaxationLimit {
        /// Unit being laid out.
        unit: String,
        /// Number of sweeps executed.
        sweeps: usize,
    },

    /// A configured resource limit was exceeded.
    #[error("{unit}: resource limit exceeded: {resource} (limit: {limit})")]
    ResourceLimitExceeded {
        /// Unit being laid out.
        unit: String,
        /// Human-readable name of the resource.
        resource: String,
        /// The configured limit.
        limit: usize,
    },

    /// An encoder could not split an immediate.
    #[error(transparent)]
    Split(#[from] SplitError),
}

impl LayoutError {
    /// Name of the unit the error belongs to, if it carries one.
    #[must_use]
    pub fn unit(&self) -> Option<&str> {
        match self {
            LayoutError::UndefinedLabel { unit, .. }
            | LayoutError::DuplicateLabel { unit, .. }
            | LayoutError::InvalidAlignment { unit, .. }
            | LayoutError::UnalignedBranch { unit, .. }
            | LayoutError::UnreachableTarget { unit, .. }
            | LayoutError::AddressOverflow { unit, .. }
            | LayoutError::RelaxationLimit { unit, .. }
            | LayoutError::ResourceLimitExceeded { unit, .. } => Some(unit.as_str()),
            LayoutError::Split(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn split_misaligned_display() {
        let err = SplitError::Misaligned {
            value: 0xffffff,
            shift: 1,
        };
        assert_eq!(format!("{}", err), "0xffffff is not a multiple of 2");
    }

    #[test]
    fn split_out_of_range_display() {
        let err = SplitError::OutOfRange {
            value: 0x1001000,
            max: 0x1000ffe,
        };
        assert_eq!(
            format!("{}", err),
            "0x1001000 is too large for a scaled 24-bit unsigned immediate (max 0x1000ffe)"
        );
    }

    #[test]
    fn unreachable_display() {
        let err = LayoutError::UnreachableTarget {
            unit: "f".into(),
            label: "far".into(),
            disp: 200 << 20,
            max: (1 << 27) - 4,
        };
        assert_eq!(
            format!("{}", err),
            "f: branch target 'far' unreachable (displacement=209715200, max=±134217724)"
        );
    }

    #[test]
    fn address_overflow_display() {
        let err = LayoutError::AddressOverflow {
            unit: "hi".into(),
            base: u64::MAX - 3,
            size: 8,
        };
        assert_eq!(
            format!("{}", err),
            "hi: unit of up to 0x8 bytes does not fit at base 0xfffffffffffffffc"
        );
    }

    #[test]
    fn relaxation_limit_display() {
        let err = LayoutError::RelaxationLimit {
            unit: "main".into(),
            sweeps: 7,
        };
        assert_eq!(
            format!("{}", err),
            "main: layout did not converge after 7 sweeps (internal error)"
        );
    }

    #[test]
    fn split_error_converts_transparently() {
        let err: LayoutError = SplitError::InvalidShift { shift: 4 }.into();
        assert_eq!(format!("{}", err), "scale shift 4 is not in 0..=3");
        assert_eq!(err.unit(), None);
    }

    #[test]
    fn unit_name_exposed() {
        let err = LayoutError::UndefinedLabel {
            unit: "u0".into(),
            label: "x".into(),
        };
        assert_eq!(err.unit(), Some("u0"));
    }
}
