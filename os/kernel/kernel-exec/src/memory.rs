//! # Virtual-Memory Collaborator Contract
//!
//! The loader never walks page tables itself. Everything it needs from the
//! memory manager is expressed by [`VirtualMemory`], acting on an explicit
//! [`AddressSpaceHandle`] instead of reading the paging root behind the
//! caller's back.
//!
//! ## Page permissions
//!
//! [`PageAccess`] carries the four bits the loader cares about. A kernel
//! implementation maps them onto its leaf entry bits, typically:
//!
//! | `PageAccess`  | x86-64 leaf                     |
//! |---------------|---------------------------------|
//! | `read`        | `PRESENT`                       |
//! | `write`       | `WRITABLE`                      |
//! | `!execute`    | `NX`                            |
//! | `user`        | `USER` (U/S = 1)                |

use crate::addresses::{UserPage, VirtualAddress};
use crate::elf::SegmentFlags;
use bitfield_struct::bitfield;
use core::fmt;

/// Root of a page-table hierarchy (the PML4 frame as loaded into CR3).
///
/// Opaque to the loader; only the memory collaborator interprets it.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct AddressSpaceHandle(u64);

impl AddressSpaceHandle {
    /// Build a handle from a raw paging-root register value.
    ///
    /// The low 12 bits (PWT/PCD/PCID) are stripped.
    #[inline]
    #[must_use]
    pub const fn from_root_register(raw: u64) -> Self {
        Self(raw & !0xFFF)
    }

    /// Physical address of the root table.
    #[inline]
    #[must_use]
    pub const fn root(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AddressSpaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS(0x{:016X})", self.0)
    }
}

/// Requested permissions of a single user page.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct PageAccess {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
    #[bits(4)]
    __: u8,
}

impl PageAccess {
    /// Readable, writable, user-accessible, not executable.
    ///
    /// Used while an image is being copied in, and for stack and argument pages.
    #[inline]
    #[must_use]
    pub const fn user_data() -> Self {
        Self::new()
            .with_read(true)
            .with_write(true)
            .with_user(true)
    }

    /// Every permission granted by either `self` or `other`.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }
}

impl From<SegmentFlags> for PageAccess {
    fn from(value: SegmentFlags) -> Self {
        Self::new()
            .with_user(true)
            .with_read(value.read())
            .with_write(value.write())
            .with_execute(value.execute())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical memory while mapping {0}")]
    OutOfMemory(UserPage),
    #[error("page {0} is already mapped")]
    AlreadyMapped(UserPage),
    #[error("page {0} is not mapped")]
    NotMapped(UserPage),
    #[error("address {0} cannot be mapped")]
    InvalidAddress(VirtualAddress),
    #[error("failed to tear down the user half")]
    UnmapFailed,
}

/// Page-mapping operations consumed by the loader and the launch controller.
///
/// Implementations must make a mapping visible to the CPU before returning
/// (TLB maintenance is their concern), so that `write_bytes` on a page
/// returned by a successful `map` cannot fault.
pub trait VirtualMemory {
    /// The address space currently loaded in the paging-root register.
    fn current_address_space(&self) -> AddressSpaceHandle;

    /// Back `page` with a fresh frame and install it with `access`.
    ///
    /// # Errors
    /// [`MapError`] if no frame is available or the page cannot be installed.
    fn map(
        &mut self,
        space: AddressSpaceHandle,
        page: UserPage,
        access: PageAccess,
    ) -> Result<(), MapError>;

    /// Change the permissions of an already-mapped `page`.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if the page has no mapping.
    fn protect(
        &mut self,
        space: AddressSpaceHandle,
        page: UserPage,
        access: PageAccess,
    ) -> Result<(), MapError>;

    /// Drop every user-accessible mapping of `space` (the lower half).
    ///
    /// # Errors
    /// [`MapError::UnmapFailed`] if the teardown could not complete.
    fn unmap_user_region(&mut self, space: AddressSpaceHandle) -> Result<(), MapError>;

    /// Copy `src` to `dst` inside `space`, ignoring page write protection.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if any touched page is unmapped.
    fn write_bytes(
        &mut self,
        space: AddressSpaceHandle,
        dst: VirtualAddress,
        src: &[u8],
    ) -> Result<(), MapError>;

    /// Fill `[dst, dst + len)` inside `space` with zeros.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if any touched page is unmapped.
    fn zero_bytes(
        &mut self,
        space: AddressSpaceHandle,
        dst: VirtualAddress,
        len: u64,
    ) -> Result<(), MapError>;
}
