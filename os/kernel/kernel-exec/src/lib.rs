//! # Process Image Loading and User-Mode Entry
//!
//! This crate turns a raw ELF64 executable handed over by the boot loader
//! into a running ring-3 process. It has two halves that always run in
//! sequence:
//!
//! 1. The [`loader`] validates the image, maps every `PT_LOAD` segment into
//!    the active address space, copies the file bytes, zero-fills the BSS
//!    tail and finally applies the segment's own page permissions.
//! 2. The [`launch`] controller preserves the caller's argument string,
//!    drops the previous user half, runs the loader, maps a user stack and an
//!    argument page at fixed addresses and performs the one-way privilege
//!    transition into the loaded entry point.
//!
//! ```text
//! BootModule ──► LoadPlan ──► SegmentLoader ──► entry ──► Launcher ──► iretq
//!                (validate)   (map/copy/protect)          (stack, argument)
//! ```
//!
//! ## Collaborators
//!
//! Nothing in here touches page tables directly. All mapping work goes
//! through the [`VirtualMemory`](memory::VirtualMemory) trait, the address
//! space is an explicit [`AddressSpaceHandle`](memory::AddressSpaceHandle),
//! interrupts are suspended via [`InterruptControl`](interrupts::InterruptControl)
//! and the final jump goes through a
//! [`UserModeTrampoline`](transition::UserModeTrampoline). The x86-64
//! implementations of the hardware-facing pieces live in [`arch`].
//!
//! ## Failure model
//!
//! Malformed images, oversized arguments and invalid layouts are detected
//! before the first address-space mutation and leave the previous process
//! image intact. A mapping failure after the old user half is gone cannot be
//! rolled back; it is reported as a fatal [`LaunchError`](launch::LaunchError).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod addresses;
pub mod arch;
pub mod argument;
pub mod elf;
pub mod interrupts;
pub mod launch;
pub mod layout;
pub mod loader;
pub mod memory;
pub mod module;
pub mod privilege;
pub mod transition;

pub use addresses::{PAGE_SIZE, PageRange, USER_SPACE_END, UserPage, VirtualAddress};
pub use argument::{ARGUMENT_CAPACITY, ArgumentBuffer, ArgumentError};
pub use elf::{ElfError, ElfView, SegmentFlags};
pub use interrupts::{InterruptControl, InterruptsSuspended};
pub use launch::{LaunchError, Launcher, PreparedLaunch};
pub use layout::{LayoutError, UserLayout};
pub use loader::{LoadError, LoadPlan, SegmentLoader, load_image};
pub use memory::{AddressSpaceHandle, MapError, PageAccess, VirtualMemory};
pub use module::{BootModule, ModuleError};
pub use privilege::{Rpl, SegmentSelector, UserSelectors};
pub use transition::{UserEntry, UserModeTrampoline};
