//! # Interrupt Exclusion During a Launch
//!
//! Between dropping the old user half and the privilege transition the
//! address space is half built. Nothing may run in that window, so a launch
//! holds an [`InterruptsSuspended`] guard for its whole duration.
//!
//! The guard snapshots the previous state and restores it on drop. On the
//! success path the guard is forgotten: the iret frame re-enables interrupts
//! through `RFLAGS` instead. It is also forgotten after a fatal failure, since
//! the half-built address space must not be observed before the CPU halts.

/// Mask / unmask primitive supplied by the interrupt collaborator.
pub trait InterruptControl {
    /// Disable interrupt delivery, returning whether it was enabled before.
    fn suspend(&mut self) -> bool;

    /// Re-enable delivery if `were_enabled` is set; otherwise leave it off.
    fn resume(&mut self, were_enabled: bool);
}

/// RAII guard that suspends interrupts on creation and restores the previous
/// state on drop.
pub struct InterruptsSuspended<'a, I: InterruptControl + ?Sized> {
    control: &'a mut I,
    were_enabled: bool,
}

impl<'a, I: InterruptControl + ?Sized> InterruptsSuspended<'a, I> {
    #[must_use]
    pub fn new(control: &'a mut I) -> Self {
        let were_enabled = control.suspend();
        Self {
            control,
            were_enabled,
        }
    }

    /// Whether interrupts were enabled when the guard was taken.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl<I: InterruptControl + ?Sized> Drop for InterruptsSuspended<'_, I> {
    fn drop(&mut self) {
        self.control.resume(self.were_enabled);
    }
}
