//! # User Address-Space Layout
//!
//! Fixed virtual addresses shared by the launch controller, the loader's
//! collision checks and any test harness. They are policy, not computed.
//!
//! ```text
//! 0x0000_0700_0000_8000 ┬─────────────────────┐ ◄ stack top
//!                       │ reserved slot (8 B) │ ◄ initial RSP = top - 8
//!                       │                     │
//!                       │  user stack, 8 × 4K │   RW, NX
//! 0x0000_0700_0000_0000 ┴─────────────────────┘ ◄ stack_base
//!                         ...
//! 0x0000_0600_0000_1000 ┬─────────────────────┐
//!                       │  argument page      │   RW, NX, NUL-terminated
//! 0x0000_0600_0000_0000 ┴─────────────────────┘ ◄ argument_page (RDI)
//! ```

use crate::addresses::{PAGE_SIZE, PageRange, UserPage, VirtualAddress};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("{0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("the user stack needs at least one page")]
    EmptyStack,
    #[error("region at {0} extends past the user half")]
    OutsideUserSpace(VirtualAddress),
    #[error("reserved stack slot of {0} bytes does not fit the stack")]
    ReservedSlotTooLarge(u64),
    #[error("the argument page overlaps the user stack")]
    ArgumentOverlapsStack,
}

/// Where the launch controller places the user stack and the argument page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UserLayout {
    stack_base: VirtualAddress,
    stack_pages: u64,
    stack_reserved: u64,
    argument_page: VirtualAddress,
}

impl Default for UserLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl UserLayout {
    pub const DEFAULT: Self = Self {
        stack_base: VirtualAddress::new(0x0000_0700_0000_0000),
        stack_pages: 8,
        stack_reserved: 8,
        argument_page: VirtualAddress::new(0x0000_0600_0000_0000),
    };

    #[must_use]
    pub const fn with_stack_base(mut self, base: VirtualAddress) -> Self {
        self.stack_base = base;
        self
    }

    #[must_use]
    pub const fn with_stack_pages(mut self, pages: u64) -> Self {
        self.stack_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_stack_reserved(mut self, bytes: u64) -> Self {
        self.stack_reserved = bytes;
        self
    }

    #[must_use]
    pub const fn with_argument_page(mut self, page: VirtualAddress) -> Self {
        self.argument_page = page;
        self
    }

    #[inline]
    #[must_use]
    pub const fn stack_base(&self) -> VirtualAddress {
        self.stack_base
    }

    #[inline]
    #[must_use]
    pub const fn stack_pages(&self) -> u64 {
        self.stack_pages
    }

    #[inline]
    #[must_use]
    pub const fn stack_size(&self) -> u64 {
        self.stack_pages.saturating_mul(PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn stack_top(&self) -> VirtualAddress {
        VirtualAddress::new(self.stack_base.as_u64().saturating_add(self.stack_size()))
    }

    /// Initial user stack pointer: the stack top minus the reserved slot.
    #[inline]
    #[must_use]
    pub const fn initial_stack_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.stack_top().as_u64().saturating_sub(self.stack_reserved))
    }

    #[inline]
    #[must_use]
    pub const fn argument_page(&self) -> VirtualAddress {
        self.argument_page
    }

    /// Pages backing the user stack.
    #[must_use]
    pub const fn stack_range(&self) -> PageRange {
        PageRange::covering_saturating(self.stack_base, self.stack_size())
    }

    /// The single page holding the argument buffer.
    #[must_use]
    pub const fn argument_range(&self) -> PageRange {
        PageRange::covering_saturating(self.argument_page, PAGE_SIZE)
    }

    /// True if `range` shares a page with the stack or the argument page.
    #[must_use]
    pub const fn collides_with(&self, range: &PageRange) -> bool {
        range.overlaps(&self.stack_range()) || range.overlaps(&self.argument_range())
    }

    /// Check that every region is page aligned, non-empty, inside the user half
    /// and that the regions do not overlap.
    ///
    /// # Errors
    /// The first [`LayoutError`] found.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if UserPage::from_base(self.stack_base).is_none() {
            return Err(LayoutError::Unaligned(self.stack_base));
        }
        if UserPage::from_base(self.argument_page).is_none() {
            return Err(LayoutError::Unaligned(self.argument_page));
        }
        if self.stack_pages == 0 {
            return Err(LayoutError::EmptyStack);
        }

        let stack_end = self
            .stack_pages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| self.stack_base.checked_add(len))
            .ok_or(LayoutError::OutsideUserSpace(self.stack_base))?;
        // The end is exclusive, so the last stack byte must be a user address.
        if !VirtualAddress::new(stack_end.as_u64() - 1).is_user() {
            return Err(LayoutError::OutsideUserSpace(self.stack_base));
        }

        let argument_end = self
            .argument_page
            .checked_add(PAGE_SIZE - 1)
            .ok_or(LayoutError::OutsideUserSpace(self.argument_page))?;
        if !argument_end.is_user() {
            return Err(LayoutError::OutsideUserSpace(self.argument_page));
        }

        if self.stack_reserved >= self.stack_size() {
            return Err(LayoutError::ReservedSlotTooLarge(self.stack_reserved));
        }

        if self.stack_range().overlaps(&self.argument_range()) {
            return Err(LayoutError::ArgumentOverlapsStack);
        }

        Ok(())
    }
}
