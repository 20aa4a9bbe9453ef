//! Scaled 24-bit unsigned immediate splitting.
//!
//! A64 can only add a 12-bit unsigned immediate (optionally shifted left by 12)
//! and load/store with a 12-bit unsigned offset scaled by the access size.
//! Offsets that fit neither field alone are materialised as a pair:
//!
//! ```text
//! ADD  Xtmp, Xn, #hi            ; hi = imm12 << 12
//! LDR  Rt, [Xtmp, #lo << scale] ; lo = imm12
//! ```
//!
//! [`split_imm24_scaled`] chooses `(hi, lo)` so that `hi + (lo << shift) == value`.

use crate::error::SplitError;

/// Largest high component: a 12-bit field shifted left by 12.
pub const MAX_HI: u32 = 0xFFF000;

/// Largest low component before scaling.
pub const MAX_LO: u32 = 0xFFF;

/// Width of the memory access paired with the low component.
///
/// The scale of the load/store offset field is `log2(bytes)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessSize {
    /// 1-byte access (LDRB/STRB), unscaled.
    Byte,
    /// 2-byte access (LDRH/STRH).
    Half,
    /// 4-byte access (LDR Wt / STR Wt).
    Word,
    /// 8-byte access (LDR Xt / STR Xt).
    Double,
}

impl AccessSize {
    /// Scale shift applied to the 12-bit offset field.
    #[must_use]
    pub fn shift(self) -> u32 {
        match self {
            AccessSize::Byte => 0,
            AccessSize::Half => 1,
            AccessSize::Word => 2,
            AccessSize::Double => 3,
        }
    }

    /// Access width in bytes.
    #[must_use]
    pub fn bytes(self) -> u32 {
        1 << self.shift()
    }

    /// The `size` field of the load/store encoding.
    pub(crate) fn size_bits(self) -> u32 {
        self.shift()
    }
}

/// Largest value [`split_imm24_scaled`] accepts for `shift`.
#[must_use]
pub fn max_split_value(shift: u32) -> u32 {
    MAX_HI + (MAX_LO << shift)
}

/// Split `value` into `(hi, lo)` with `hi + (lo << shift) == value`.
///
/// `hi` is a multiple of 4096 no greater than [`MAX_HI`] and `lo` is in
/// `0..=MAX_LO`. When the natural high part would overflow its field, the
/// excess is pushed into `lo` instead, which extends the accepted range to
/// [`max_split_value`].
///
/// # Errors
///
/// - [`SplitError::InvalidShift`] if `shift > 3`.
/// - [`SplitError::OutOfRange`] if `value > max_split_value(shift)`.
/// - [`SplitError::Misaligned`] if any of the low `shift` bits of `value` are set.
///
/// # Examples
///
/// ```
/// use a64_layout::imm::split_imm24_scaled;
///
/// assert_eq!(split_imm24_scaled(0x1001, 0), Ok((0x1000, 0x1)));
/// assert_eq!(split_imm24_scaled(0xfffffe, 1), Ok((0xffe000, 0xfff)));
/// assert!(split_imm24_scaled(0xffffff, 1).is_err());
/// ```
pub fn split_imm24_scaled(value: u32, shift: u32) -> Result<(u32, u32), SplitError> {
    if shift > 3 {
        return Err(SplitError::InvalidShift { shift });
    }
    let max = max_split_value(shift);
    if value > max {
        return Err(SplitError::OutOfRange { value, max });
    }
    if value & ((1 << shift) - 1) != 0 {
        return Err(SplitError::Misaligned { value, shift });
    }

    let mut lo = (value >> shift) & MAX_LO;
    let mut hi = value - (lo << shift);
    if hi > MAX_HI {
        hi = MAX_HI;
        lo = (value - hi) >> shift;
    }
    debug_assert!(hi & !MAX_HI == 0 && lo <= MAX_LO);
    Ok((hi, lo))
}

/// Split for a given access width; see [`split_imm24_scaled`].
///
/// # Errors
///
/// Same as [`split_imm24_scaled`], minus `InvalidShift`.
pub fn split_for_access(value: u32, access: AccessSize) -> Result<(u32, u32), SplitError> {
    split_imm24_scaled(value, access.shift())
}
