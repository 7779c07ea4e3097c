//! # Privilege Transition Contract
//!
//! The hand-off into ring 3 is the one operation that cannot be expressed
//! in safe Rust. It is reduced to a narrow trait taking a fully computed
//! [`UserEntry`] and never returning.

use crate::addresses::VirtualAddress;
use crate::privilege::SegmentSelector;

/// Everything the CPU needs to start executing the new process.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UserEntry {
    /// Loaded into `CS`.
    pub code_selector: SegmentSelector,
    /// Loaded into `SS`, `DS` and `ES`.
    pub data_selector: SegmentSelector,
    /// Initial `RSP`.
    pub stack_pointer: VirtualAddress,
    /// Initial `RIP`, the image's entry point.
    pub instruction_pointer: VirtualAddress,
    /// Passed in the first argument register (`RDI`).
    pub argument: VirtualAddress,
}

/// One-way jump into user mode.
pub trait UserModeTrampoline {
    /// Transfer control to `entry` at reduced privilege.
    ///
    /// # Safety
    /// The active address space must contain executable user mappings at
    /// `entry.instruction_pointer`, a writable user stack below
    /// `entry.stack_pointer`, and both selectors must reference valid ring-3
    /// descriptors. No kernel state may be borrowed across the call; it never
    /// comes back.
    unsafe fn enter(&self, entry: UserEntry) -> !;
}
