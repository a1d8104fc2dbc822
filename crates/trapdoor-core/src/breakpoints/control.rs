//! Bit layouts of DR6 (status) and DR7 (control)
//!
//! DR7, per slot `n` (0-3):
//!
//! | bits            | meaning                        |
//! |-----------------|--------------------------------|
//! | `2n`            | local enable `Ln`              |
//! | `2n + 1`        | global enable `Gn`             |
//! | `16 + 4n ..+2`  | R/W: 00 exec, 01 write, 11 r/w |
//! | `18 + 4n ..+2`  | LEN: 00 1, 01 2, 11 4, 10 8    |
//!
//! plus `LE` (bit 8) and `GE` (bit 9), the exact-breakpoint enables.

use bitflags::bitflags;

bitflags! {
    /// DR7
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugControl: u64 {
        const L0 = 1 << 0;
        const G0 = 1 << 1;
        const L1 = 1 << 2;
        const G1 = 1 << 3;
        const L2 = 1 << 4;
        const G2 = 1 << 5;
        const L3 = 1 << 6;
        const G3 = 1 << 7;
        /// Local exact breakpoint enable
        const LE = 1 << 8;
        /// Global exact breakpoint enable
        const GE = 1 << 9;
        /// General detect: trap on debug register access
        const GD = 1 << 13;
    }
}

bitflags! {
    /// DR6
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugStatus: u64 {
        const B0 = 1 << 0;
        const B1 = 1 << 1;
        const B2 = 1 << 2;
        const B3 = 1 << 3;
        /// Debug register access detected
        const BD = 1 << 13;
        /// Single step
        const BS = 1 << 14;
        /// Task switch
        const BT = 1 << 15;
    }
}

/// Mask of one two-bit field
pub(crate) const FIELD_MASK: u64 = 0b11;

impl DebugControl
{
    /// `Ln` for slot `n`
    pub const fn local(slot: u8) -> Self
    {
        Self::from_bits_retain(1 << (2 * slot))
    }

    /// `Gn` for slot `n`
    pub const fn global(slot: u8) -> Self
    {
        Self::from_bits_retain(1 << (2 * slot + 1))
    }

    /// Shift of the R/W field of slot `n`
    pub const fn mode_shift(slot: u8) -> u32
    {
        16 + 4 * slot as u32
    }

    /// Shift of the LEN field of slot `n`
    pub const fn length_shift(slot: u8) -> u32
    {
        18 + 4 * slot as u32
    }

    /// Raw R/W field of slot `n`
    pub const fn mode_bits(self, slot: u8) -> u64
    {
        (self.bits() >> Self::mode_shift(slot)) & FIELD_MASK
    }

    /// Raw LEN field of slot `n`
    pub const fn length_bits(self, slot: u8) -> u64
    {
        (self.bits() >> Self::length_shift(slot)) & FIELD_MASK
    }

    /// Replace the R/W and LEN fields of slot `n`
    #[must_use]
    pub const fn with_fields(self, slot: u8, mode: u64, length: u64) -> Self
    {
        let cleared = self.bits()
            & !(FIELD_MASK << Self::mode_shift(slot))
            & !(FIELD_MASK << Self::length_shift(slot));
        Self::from_bits_retain(
            cleared
                | ((mode & FIELD_MASK) << Self::mode_shift(slot))
                | ((length & FIELD_MASK) << Self::length_shift(slot)),
        )
    }

    /// Whether slot `n` is enabled locally or globally
    pub const fn is_armed(self, slot: u8) -> bool
    {
        self.bits() & (Self::local(slot).bits() | Self::global(slot).bits()) != 0
    }
}

impl DebugStatus
{
    /// `Bn` for slot `n`
    pub const fn hit(slot: u8) -> Self
    {
        Self::from_bits_retain(1 << slot)
    }
}
