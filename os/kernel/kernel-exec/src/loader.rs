//! # Segment Loader
//!
//! Reproduces the memory image of an ELF64 executable in an address space.
//!
//! Loading happens in two phases:
//!
//! 1. [`LoadPlan`] parses and validates the whole image without touching any
//!    mapping. Every malformed-image condition is reported here.
//! 2. [`SegmentLoader`] walks the validated `PT_LOAD` segments in table order
//!    and, for each one:
//!    - maps every page of `[floor(vaddr), vaddr + memsz)` read-write and
//!      non-executable,
//!    - copies `filesz` bytes from the image,
//!    - zero-fills `[filesz, memsz)`,
//!    - re-applies the segment's own permissions to every page.
//!
//! Segments may share a page as long as their byte ranges are disjoint. A
//! shared page is mapped and protected once, by the first segment on it, with
//! the union of the permissions of every segment it holds bytes of.
//!
//! The first failed mapping request ends the load. The pages mapped so far
//! stay mapped; the caller decides what that means for the launch.
//!
//! ```text
//!   image                          address space
//!  ┌────────┐ p_offset            ┌──────────────┐ floor(vaddr)
//!  │        ├───── filesz ───────►│ file bytes   │ ◄ vaddr
//!  │        │                     ├──────────────┤
//!  └────────┘                     │ zero (BSS)   │
//!                                 └──────────────┘ ◄ vaddr + memsz
//! ```

use crate::addresses::{PageRange, USER_SPACE_END, UserPage, VirtualAddress};
use crate::elf::{ElfError, ElfView, ProgramHeader, SegmentFlags};
use crate::layout::UserLayout;
use crate::memory::{AddressSpaceHandle, MapError, PageAccess, VirtualMemory};
use log::{debug, error, trace};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("invalid ELF image: {0}")]
    Elf(#[from] ElfError),
    #[error("segment at {vaddr} has memsz 0x{memsz:X} below filesz 0x{filesz:X}")]
    MemSizeBelowFileSize {
        vaddr: VirtualAddress,
        filesz: u64,
        memsz: u64,
    },
    #[error("segment at {vaddr} reads file bytes past the end of the image")]
    FileRangeOutOfBounds { vaddr: VirtualAddress },
    #[error("segment at {0} wraps the address space")]
    AddressOverflow(VirtualAddress),
    #[error("segment at {0} extends past the user half")]
    OutsideUserSpace(VirtualAddress),
    #[error("segment at {0} maps the null page")]
    NullPage(VirtualAddress),
    #[error("segments at {first} and {second} overlap")]
    OverlappingSegments {
        first: VirtualAddress,
        second: VirtualAddress,
    },
    #[error("segment at {0} collides with the user stack or argument page")]
    ReservedRegionCollision(VirtualAddress),
    #[error("entry point {0} is not a user address")]
    EntryOutsideUserSpace(VirtualAddress),
    #[error("mapping request failed: {0}")]
    Map(#[from] MapError),
}

/// A loadable segment after validation.
#[derive(Debug, Copy, Clone)]
pub struct PlannedSegment<'a> {
    pub header: ProgramHeader,
    /// Pages covering `[floor(vaddr), vaddr + memsz)`.
    pub pages: PageRange,
    /// The `filesz` bytes to copy.
    pub file_bytes: &'a [u8],
}

impl PlannedSegment<'_> {
    #[inline]
    #[must_use]
    pub const fn vaddr(&self) -> VirtualAddress {
        self.header.p_vaddr
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> SegmentFlags {
        self.header.p_flags
    }

    /// Exclusive end of `[vaddr, vaddr + memsz)`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        let end = self.header.p_vaddr.as_u64().saturating_add(self.header.p_memsz);
        VirtualAddress::new(end)
    }

    /// True if the byte ranges of the two segments intersect.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.vaddr().as_u64() < other.end().as_u64()
            && other.vaddr().as_u64() < self.end().as_u64()
    }

    /// Length of the zero-filled tail.
    #[inline]
    #[must_use]
    pub const fn bss_len(&self) -> u64 {
        self.header.p_memsz.saturating_sub(self.header.p_filesz)
    }
}

/// A parsed image whose segments passed every check.
#[derive(Debug, Copy, Clone)]
pub struct LoadPlan<'a> {
    view: ElfView<'a>,
}

impl<'a> LoadPlan<'a> {
    /// Validate `image` on its own.
    ///
    /// # Errors
    /// A [`LoadError`] describing the first malformed-image condition found.
    pub fn new(image: &'a [u8]) -> Result<Self, LoadError> {
        Self::validate(image, None)
    }

    /// Validate `image` and additionally require that no segment shares a
    /// page with the stack or argument page of `layout`.
    ///
    /// # Errors
    /// See [`LoadPlan::new`]; also [`LoadError::ReservedRegionCollision`].
    pub fn for_layout(image: &'a [u8], layout: &UserLayout) -> Result<Self, LoadError> {
        Self::validate(image, Some(layout))
    }

    fn validate(image: &'a [u8], layout: Option<&UserLayout>) -> Result<Self, LoadError> {
        let view = ElfView::parse(image)?;

        let entry = view.entry();
        if !entry.is_user() {
            return Err(LoadError::EntryOutsideUserSpace(entry));
        }

        for (index, ph) in view
            .loadable_segments()
            .filter(|ph| ph.p_memsz != 0)
            .enumerate()
        {
            let seg = plan_segment(&view, &ph)?;

            if layout.is_some_and(|l| l.collides_with(&seg.pages)) {
                return Err(LoadError::ReservedRegionCollision(seg.vaddr()));
            }

            // Compare against every earlier segment; tables are short.
            for earlier in view
                .loadable_segments()
                .filter(|ph| ph.p_memsz != 0)
                .take(index)
            {
                let earlier = plan_segment(&view, &earlier)?;
                if earlier.overlaps(&seg) {
                    return Err(LoadError::OverlappingSegments {
                        first: earlier.vaddr(),
                        second: seg.vaddr(),
                    });
                }
            }
        }

        Ok(Self { view })
    }

    /// The header's entry address, verbatim.
    #[inline]
    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.view.entry()
    }

    #[inline]
    #[must_use]
    pub const fn view(&self) -> &ElfView<'a> {
        &self.view
    }

    /// Validated `PT_LOAD` segments with a non-zero memory size, in table order.
    pub fn segments(&self) -> impl Iterator<Item = PlannedSegment<'a>> + use<'a> {
        let view = self.view;
        view.loadable_segments()
            .filter(|ph| ph.p_memsz != 0)
            .filter_map(move |ph| plan_segment(&view, &ph).ok())
    }

    /// Combined permissions of every segment with bytes on `page`.
    #[must_use]
    pub fn page_access(&self, page: UserPage) -> PageAccess {
        self.segments()
            .filter(|seg| seg.pages.contains(page))
            .fold(PageAccess::new(), |access, seg| {
                access.union(PageAccess::from(seg.flags()))
            })
    }

    /// True if one of the first `count` segments already covers `page`.
    fn covered_before(&self, count: usize, page: UserPage) -> bool {
        self.segments()
            .take(count)
            .any(|seg| seg.pages.contains(page))
    }
}

fn plan_segment<'a>(
    view: &ElfView<'a>,
    ph: &ProgramHeader,
) -> Result<PlannedSegment<'a>, LoadError> {
    let vaddr = ph.p_vaddr;
    if ph.p_memsz < ph.p_filesz {
        return Err(LoadError::MemSizeBelowFileSize {
            vaddr,
            filesz: ph.p_filesz,
            memsz: ph.p_memsz,
        });
    }

    let file_bytes = view
        .segment_bytes(ph)
        .ok_or(LoadError::FileRangeOutOfBounds { vaddr })?;

    let pages =
        PageRange::covering(vaddr, ph.p_memsz).ok_or(LoadError::AddressOverflow(vaddr))?;
    if pages.end() > USER_SPACE_END {
        return Err(LoadError::OutsideUserSpace(vaddr));
    }
    if pages.start() == VirtualAddress::zero() {
        return Err(LoadError::NullPage(vaddr));
    }

    Ok(PlannedSegment {
        header: *ph,
        pages,
        file_bytes,
    })
}

/// Maps, fills and protects the segments of a [`LoadPlan`].
pub struct SegmentLoader<'v, V: VirtualMemory + ?Sized> {
    vm: &'v mut V,
    space: AddressSpaceHandle,
}

impl<'v, V: VirtualMemory + ?Sized> SegmentLoader<'v, V> {
    #[must_use]
    pub const fn new(vm: &'v mut V, space: AddressSpaceHandle) -> Self {
        Self { vm, space }
    }

    /// Load every segment of `plan` and return its entry address.
    ///
    /// # Errors
    /// [`LoadError::Map`] for the first mapping, copy or protection request
    /// the memory collaborator refuses.
    pub fn load(&mut self, plan: &LoadPlan<'_>) -> Result<VirtualAddress, LoadError> {
        for ph in plan
            .view()
            .program_headers()
            .filter(|ph| !ph.is_load() || ph.p_memsz == 0)
        {
            trace!(
                "Skipping segment: type={:#x} vaddr={} memsz={:#x}",
                ph.p_type, ph.p_vaddr, ph.p_memsz
            );
        }

        for (index, seg) in plan.segments().enumerate() {
            self.load_segment(plan, index, &seg)?;
        }

        debug!("Image loaded, entry at {}", plan.entry());
        Ok(plan.entry())
    }

    fn load_segment(
        &mut self,
        plan: &LoadPlan<'_>,
        index: usize,
        seg: &PlannedSegment<'_>,
    ) -> Result<(), MapError> {
        let ph = &seg.header;
        debug!(
            "Loading segment: type={:#x} vaddr={} filesz={:#x} memsz={:#x} offset={:#x} flags={:?}",
            ph.p_type, ph.p_vaddr, ph.p_filesz, ph.p_memsz, ph.p_offset, ph.p_flags
        );

        // Writable while the bytes go in, whatever the final permissions are.
        let provisional = PageAccess::user_data();
        for page in &seg.pages {
            if plan.covered_before(index, page) {
                trace!("Page {page} already mapped by an earlier segment");
                continue;
            }
            trace!("Mapping {page} as {provisional:?}");
            self.vm
                .map(self.space, page, provisional)
                .inspect_err(|e| {
                    error!("Mapping {page} of segment at {} failed: {e}", ph.p_vaddr);
                })?;
        }

        self.vm
            .write_bytes(self.space, seg.vaddr(), seg.file_bytes)
            .inspect_err(|e| error!("Copying segment at {} failed: {e}", ph.p_vaddr))?;

        let bss = seg.bss_len();
        if bss > 0 {
            self.vm
                .zero_bytes(self.space, seg.vaddr() + ph.p_filesz, bss)
                .inspect_err(|e| {
                    error!("Zeroing BSS of segment at {} failed: {e}", ph.p_vaddr);
                })?;
        }

        for page in &seg.pages {
            if plan.covered_before(index, page) {
                continue;
            }
            let access = plan.page_access(page);
            trace!("Protecting {page} as {access:?}");
            self.vm
                .protect(self.space, page, access)
                .inspect_err(|e| {
                    error!("Protecting {page} of segment at {} failed: {e}", ph.p_vaddr);
                })?;
        }
        Ok(())
    }
}

/// Validate `image` and load it into `space`.
///
/// # Errors
/// Any [`LoadError`]; malformed images are rejected before the first mapping.
pub fn load_image<V: VirtualMemory + ?Sized>(
    vm: &mut V,
    space: AddressSpaceHandle,
    image: &[u8],
) -> Result<VirtualAddress, LoadError> {
    let plan = LoadPlan::new(image)?;
    SegmentLoader::new(vm, space).load(&plan)
}
