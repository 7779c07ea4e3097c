//! # Launch Controller
//!
//! Orchestrates a full process launch on the active address space:
//!
//! | Step | Action                                   | Failure        |
//! |------|------------------------------------------|----------------|
//! | 0    | validate layout, argument and image      | recoverable    |
//! | 1    | suspend interrupts                       | -              |
//! | 2    | drop the previous user half              | fatal          |
//! | 3    | load the image                           | fatal          |
//! | 4    | map the user stack (RW, NX)              | fatal          |
//! | 5    | map the argument page, copy the argument | fatal          |
//! | 6    | privilege transition                     | never returns  |
//!
//! Recoverable failures leave the previous address space untouched. Once
//! step 2 has started there is no previous image to fall back to, so any
//! later failure is reported as fatal (see [`LaunchError::is_fatal`]) and
//! interrupts stay suspended for the caller to halt.

use crate::argument::{ArgumentBuffer, ArgumentError};
use crate::interrupts::{InterruptControl, InterruptsSuspended};
use crate::layout::{LayoutError, UserLayout};
use crate::loader::{LoadError, LoadPlan, SegmentLoader};
use crate::memory::{MapError, PageAccess, VirtualMemory};
use crate::module::BootModule;
use crate::privilege::UserSelectors;
use crate::transition::{UserEntry, UserModeTrampoline};
use core::convert::Infallible;
use log::{error, info, trace};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid user layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("invalid launch argument: {0}")]
    Argument(#[from] ArgumentError),
    #[error("malformed image: {0}")]
    Image(LoadError),
    #[error("failed to drop the previous user image: {0}")]
    Teardown(MapError),
    #[error("failed to load the image: {0}")]
    Load(LoadError),
    #[error("failed to map the user stack: {0}")]
    Stack(MapError),
    #[error("failed to set up the argument page: {0}")]
    ArgumentPage(MapError),
}

impl LaunchError {
    /// True if the previous user image was already dropped when the launch
    /// failed. The caller has nothing to return to and must halt or reschedule.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Teardown(_) | Self::Load(_) | Self::Stack(_) | Self::ArgumentPage(_)
        )
    }
}

/// Launches processes on the address space currently active in `vm`.
pub struct Launcher<'a, V: VirtualMemory + ?Sized, I: InterruptControl + ?Sized> {
    vm: &'a mut V,
    interrupts: &'a mut I,
    layout: UserLayout,
    selectors: UserSelectors,
}

impl<'a, V: VirtualMemory + ?Sized, I: InterruptControl + ?Sized> Launcher<'a, V, I> {
    #[must_use]
    pub const fn new(vm: &'a mut V, interrupts: &'a mut I) -> Self {
        Self {
            vm,
            interrupts,
            layout: UserLayout::DEFAULT,
            selectors: UserSelectors::DEFAULT,
        }
    }

    #[must_use]
    pub const fn with_layout(mut self, layout: UserLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub const fn with_selectors(mut self, selectors: UserSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &UserLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn selectors(&self) -> &UserSelectors {
        &self.selectors
    }

    /// Build the new process image and everything the entry needs, short of
    /// the privilege transition itself.
    ///
    /// Interrupts stay suspended while the returned [`PreparedLaunch`] lives.
    ///
    /// # Errors
    /// A recoverable [`LaunchError`] if the layout, the argument or the image
    /// is invalid; nothing has been changed in that case. A fatal one if a
    /// mapping request failed after the previous user half was dropped.
    /// Interrupts are left suspended after a fatal error.
    pub fn prepare(
        &mut self,
        image: &[u8],
        argument: Option<&[u8]>,
    ) -> Result<PreparedLaunch<'_, I>, LaunchError> {
        self.prepare_inner(image, argument).inspect_err(|e| {
            error!("Launch failed (fatal: {}): {e}", e.is_fatal());
        })
    }

    fn prepare_inner(
        &mut self,
        image: &[u8],
        argument: Option<&[u8]>,
    ) -> Result<PreparedLaunch<'_, I>, LaunchError> {
        self.layout.validate()?;

        // The argument may live in the user half that is about to go away.
        let argument = ArgumentBuffer::capture_optional(argument)?;
        let plan = LoadPlan::for_layout(image, &self.layout).map_err(LaunchError::Image)?;

        let guard = InterruptsSuspended::new(&mut *self.interrupts);
        match build_image(&mut *self.vm, &self.layout, &self.selectors, &plan, &argument) {
            Ok(entry) => Ok(PreparedLaunch {
                entry,
                interrupts: guard,
            }),
            Err(err) => {
                // Nothing may run on the half-built address space.
                core::mem::forget(guard);
                Err(err)
            }
        }
    }

    /// Launch the process in `module` and never come back on success.
    ///
    /// # Errors
    /// See [`Launcher::prepare`]. After a recoverable error interrupts are as
    /// they were on entry; after a fatal one they stay suspended.
    ///
    /// # Safety
    /// `module` must describe readable memory that lies outside the user half
    /// (see [`BootModule::bytes`]). The selectors must reference valid ring-3
    /// descriptors of the loaded GDT (see [`UserModeTrampoline::enter`]).
    pub unsafe fn launch<T: UserModeTrampoline + ?Sized>(
        &mut self,
        module: &BootModule<'_>,
        argument: Option<&[u8]>,
        trampoline: &T,
    ) -> Result<Infallible, LaunchError> {
        let image = unsafe { module.bytes() };
        info!(
            "Launching module {} ({} bytes) ...",
            module.name().unwrap_or("<unnamed>"),
            module.size()
        );
        let prepared = self.prepare(image, argument)?;
        unsafe { prepared.enter(trampoline) }
    }
}

/// Steps 2 to 5 on `vm`'s active address space. Every error is fatal.
fn build_image<V: VirtualMemory + ?Sized>(
    vm: &mut V,
    layout: &UserLayout,
    selectors: &UserSelectors,
    plan: &LoadPlan<'_>,
    argument: &ArgumentBuffer,
) -> Result<UserEntry, LaunchError> {
    let space = vm.current_address_space();

    info!("Unmapping previous user image in {space:?} ...");
    vm.unmap_user_region(space).map_err(LaunchError::Teardown)?;

    info!("Loading image ...");
    let entry = SegmentLoader::new(&mut *vm, space)
        .load(plan)
        .map_err(LaunchError::Load)?;

    info!(
        "Mapping user stack at {} ({} pages) ...",
        layout.stack_base(),
        layout.stack_pages()
    );
    for page in layout.stack_range() {
        trace!("Mapping stack page {page}");
        vm.map(space, page, PageAccess::user_data())
            .map_err(LaunchError::Stack)?;
    }

    for page in layout.argument_range() {
        trace!("Mapping argument page {page}");
        vm.map(space, page, PageAccess::user_data())
            .map_err(LaunchError::ArgumentPage)?;
    }
    vm.write_bytes(space, layout.argument_page(), argument.as_bytes_with_nul())
        .map_err(LaunchError::ArgumentPage)?;

    Ok(UserEntry {
        code_selector: selectors.code(),
        data_selector: selectors.data(),
        stack_pointer: layout.initial_stack_pointer(),
        instruction_pointer: entry,
        argument: layout.argument_page(),
    })
}

/// A fully built process image, ready for the privilege transition.
pub struct PreparedLaunch<'g, I: InterruptControl + ?Sized> {
    entry: UserEntry,
    interrupts: InterruptsSuspended<'g, I>,
}

impl<I: InterruptControl + ?Sized> PreparedLaunch<'_, I> {
    /// The values handed to the trampoline.
    #[inline]
    #[must_use]
    pub const fn entry(&self) -> &UserEntry {
        &self.entry
    }

    /// Perform the privilege transition.
    ///
    /// Interrupts are not resumed here; the transition re-enables them for
    /// user mode.
    ///
    /// # Safety
    /// See [`UserModeTrampoline::enter`].
    pub unsafe fn enter<T: UserModeTrampoline + ?Sized>(self, trampoline: &T) -> ! {
        let Self { entry, interrupts } = self;
        core::mem::forget(interrupts);

        info!(
            "Entering user mode at {} (rsp {}, arg {}) ...",
            entry.instruction_pointer, entry.stack_pointer, entry.argument
        );
        unsafe { trampoline.enter(entry) }
    }
}
