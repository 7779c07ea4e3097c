//! # User Virtual Addresses and Pages
//!
//! Thin, zero-cost wrappers that keep raw `u64` addresses, page bases and page
//! ranges apart at the type level. Only the 4 KiB page granularity shared with
//! the memory collaborator is modelled here.
//!
//! ```text
//!  vaddr = 0x2010, memsz = 0x1ff0
//!
//!  0x2000        0x3000        0x4000
//!    ├─────────────┼─────────────┤
//!    │  page 0     │  page 1     │     PageRange::covering(0x2010, 0x1ff0)
//!    └─────────────┴─────────────┘     → [0x2000, 0x4000), 2 pages
//! ```

use core::fmt;
use core::ops::Add;

/// Page granularity in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// First address past the user-accessible lower half.
pub const USER_SPACE_END: VirtualAddress = VirtualAddress::new(0x0000_8000_0000_0000);

const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Virtual memory address.
///
/// Carries only the *kind* of the value; canonicality is checked where it
/// matters (see [`VirtualAddress::is_user`]).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Round down to the containing page boundary.
    #[inline]
    #[must_use]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// True if the address lies in the user-accessible lower half.
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 < USER_SPACE_END.0
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<UserPage> for VirtualAddress {
    #[inline]
    fn from(value: UserPage) -> Self {
        value.base()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// A 4 KiB virtual page, identified by its page-aligned base.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserPage(VirtualAddress);

impl UserPage {
    /// The page that contains `va`.
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self(va.align_down())
    }

    /// Page starting at `va`, or `None` if `va` is not page aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(va: VirtualAddress) -> Option<Self> {
        if va.is_page_aligned() {
            Some(Self(va))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    /// The following page, `None` on address-space wrap.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE) {
            Some(va) => Some(Self(va)),
            None => None,
        }
    }
}

impl fmt::Debug for UserPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page(0x{:016X})", self.0.as_u64())
    }
}

impl fmt::Display for UserPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Half-open run of pages `[start, end)`.
///
/// `end` is a byte address and need not be aligned: a page whose base is
/// below `end` is part of the range, so a trailing partial page is included.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageRange {
    start: UserPage,
    end: VirtualAddress,
}

impl PageRange {
    /// Pages touched by the byte span `[start, start + len)`.
    ///
    /// Returns `None` if the span wraps the address space.
    #[must_use]
    pub const fn covering(start: VirtualAddress, len: u64) -> Option<Self> {
        match start.checked_add(len) {
            Some(end) => Some(Self {
                start: UserPage::containing(start),
                end,
            }),
            None => None,
        }
    }

    /// Like [`covering`](Self::covering), but clamps the end at the top of the
    /// address space instead of failing.
    #[must_use]
    pub const fn covering_saturating(start: VirtualAddress, len: u64) -> Self {
        Self {
            start: UserPage::containing(start),
            end: VirtualAddress::new(start.as_u64().saturating_add(len)),
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start.base()
    }

    /// Exclusive byte end as given at construction.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Exclusive end rounded up to the next page boundary.
    #[must_use]
    pub const fn end_page_aligned(&self) -> VirtualAddress {
        let end = self.end.as_u64();
        if end & PAGE_MASK == 0 {
            self.end
        } else {
            VirtualAddress::new((end & !PAGE_MASK).saturating_add(PAGE_SIZE))
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start.base().as_u64() >= self.end.as_u64()
    }

    /// Number of pages in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (self.end.as_u64() - self.start.base().as_u64()).div_ceil(PAGE_SIZE)
    }

    /// True if the two ranges share at least one page.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.start.base().as_u64() < other.end_page_aligned().as_u64()
            && other.start.base().as_u64() < self.end_page_aligned().as_u64()
    }

    /// True if `page` is one of the pages of this range.
    #[must_use]
    pub const fn contains(&self, page: UserPage) -> bool {
        page.base().as_u64() >= self.start.base().as_u64()
            && page.base().as_u64() < self.end.as_u64()
    }

    #[must_use]
    pub const fn iter(&self) -> PageIter {
        PageIter {
            next: Some(self.start),
            end: self.end,
        }
    }
}

impl IntoIterator for PageRange {
    type Item = UserPage;
    type IntoIter = PageIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for &PageRange {
    type Item = UserPage;
    type IntoIter = PageIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the pages of a [`PageRange`], one page at a time.
#[derive(Clone, Debug)]
pub struct PageIter {
    next: Option<UserPage>,
    end: VirtualAddress,
}

impl Iterator for PageIter {
    type Item = UserPage;

    fn next(&mut self) -> Option<Self::Item> {
        let page = self.next?;
        if page.base() >= self.end {
            self.next = None;
            return None;
        }
        self.next = page.next();
        Some(page)
    }
}

impl core::iter::FusedIterator for PageIter {}
