//! # Privilege Levels and User Segment Selectors
//!
//! The privilege transition loads `CS` and `SS` from the iret frame, so both
//! selectors must carry RPL 3 and index the user descriptors of the GDT the
//! kernel installed. The GDT itself is set up elsewhere; this module only
//! encodes the selector values.
//!
//! ```text
//!  15            3 2  1  0
//! +----------------+--+----+
//! |   Index[12:0]  |TI| RPL|
//! +----------------+--+----+  (TI=0 → GDT, TI=1 → LDT)
//! ```
//!
//! | Selector   | Index | RPL | Value  |
//! |------------|-------|-----|--------|
//! | user data  | 3     | 3   | `0x1b` |
//! | user code  | 4     | 3   | `0x23` |

use bitfield_struct::bitfield;

/// RPL mask in a 16-bit selector.
pub const RPL_MASK: u16 = 0b11;

/// Requested privilege level, the low two bits of a selector.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Rpl {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

impl Rpl {
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u16 {
        self as u16
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(value: u16) -> Self {
        match value & RPL_MASK {
            0 => Self::Ring0,
            1 => Self::Ring1,
            2 => Self::Ring2,
            _ => Self::Ring3,
        }
    }
}

/// Which descriptor table a selector addresses.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Table {
    Gdt = 0,
    Ldt = 1,
}

impl Table {
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u16 {
        self as u16
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        if bits == 0 { Self::Gdt } else { Self::Ldt }
    }
}

/// 16-bit segment selector (index/TI/RPL).
#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct SegmentSelector {
    #[bits(2)]
    pub rpl: Rpl,
    #[bits(1)]
    pub table: Table,
    #[bits(13)]
    pub index: u16,
}

impl SegmentSelector {
    /// GDT selector for descriptor `index` with the given RPL.
    #[inline]
    #[must_use]
    pub const fn gdt(index: u16, rpl: Rpl) -> Self {
        Self::new()
            .with_index(index)
            .with_table(Table::Gdt)
            .with_rpl(rpl)
    }

    /// The encoded value, as pushed into an iret frame.
    #[inline]
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self.into_bits()
    }
}

/// Selectors used for the ring-3 entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UserSelectors {
    code: SegmentSelector,
    data: SegmentSelector,
}

impl Default for UserSelectors {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl UserSelectors {
    /// GDT index of the user data descriptor.
    pub const USER_DATA_INDEX: u16 = 3;
    /// GDT index of the user code descriptor.
    pub const USER_CODE_INDEX: u16 = 4;

    pub const DEFAULT: Self = Self {
        code: SegmentSelector::gdt(Self::USER_CODE_INDEX, Rpl::Ring3),
        data: SegmentSelector::gdt(Self::USER_DATA_INDEX, Rpl::Ring3),
    };

    /// Use the descriptor at `index` for `CS`. The RPL is forced to 3.
    #[must_use]
    pub const fn with_code_index(mut self, index: u16) -> Self {
        self.code = SegmentSelector::gdt(index, Rpl::Ring3);
        self
    }

    /// Use the descriptor at `index` for `SS` and the data segments.
    /// The RPL is forced to 3.
    #[must_use]
    pub const fn with_data_index(mut self, index: u16) -> Self {
        self.data = SegmentSelector::gdt(index, Rpl::Ring3);
        self
    }

    #[inline]
    #[must_use]
    pub const fn code(&self) -> SegmentSelector {
        self.code
    }

    #[inline]
    #[must_use]
    pub const fn data(&self) -> SegmentSelector {
        self.data
    }
}
