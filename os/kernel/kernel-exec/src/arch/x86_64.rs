//! # x86-64 Launch Primitives
//!
//! The pieces that need real hardware: reading the paging root, masking
//! interrupts, the `iretq` trampoline into ring 3, and raw copies into the
//! active address space for kernels whose `VirtualMemory` writes through the
//! current mappings.
//!
//! ## The iret frame
//!
//! ```text
//!   higher addresses
//!  ┌──────────────┐
//!  │ SS           │ user data selector (RPL 3)
//!  │ RSP          │ stack top - reserved slot
//!  │ RFLAGS       │ 0x202 (IF | reserved bit 1)
//!  │ CS           │ user code selector (RPL 3)
//!  │ RIP          │ entry point
//!  └──────────────┘ ◄ RSP at iretq
//! ```
//!
//! The argument page address travels in `RDI`, the first argument register
//! of the System V calling convention.

use crate::addresses::VirtualAddress;
use crate::interrupts::InterruptControl;
use crate::launch::{LaunchError, Launcher};
use crate::memory::{AddressSpaceHandle, VirtualMemory};
use crate::module::BootModule;
use crate::transition::{UserEntry, UserModeTrampoline};
use core::arch::asm;
use log::{error, trace, warn};

/// `RFLAGS` on user entry: IF set, reserved bit 1 set.
pub const USER_RFLAGS: u64 = 0x202;

/// Interrupt flag in `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

/// Read `CR3`.
///
/// # Safety
/// Must run at CPL 0.
#[inline]
#[must_use]
pub unsafe fn read_current_root() -> u64 {
    let cr3: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3
}

/// Handle of the address space loaded in `CR3`.
///
/// # Safety
/// Must run at CPL 0.
#[inline]
#[must_use]
pub unsafe fn current_address_space() -> AddressSpaceHandle {
    AddressSpaceHandle::from_root_register(unsafe { read_current_root() })
}

/// Current `RFLAGS` (via `pushfq/pop`).
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// `cli` / `sti` on the executing CPU.
///
/// Only usable where `cli`/`sti` are permitted (CPL 0).
#[derive(Debug, Default, Copy, Clone)]
pub struct CpuInterrupts;

impl InterruptControl for CpuInterrupts {
    fn suspend(&mut self) -> bool {
        let enabled = rflags() & RFLAGS_IF != 0;
        if enabled {
            unsafe { asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        enabled
    }

    fn resume(&mut self, were_enabled: bool) {
        if were_enabled {
            unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) }
        }
    }
}

/// Enters ring 3 by building an iret frame and executing `iretq`.
#[derive(Debug, Default, Copy, Clone)]
pub struct IretqTrampoline;

impl UserModeTrampoline for IretqTrampoline {
    unsafe fn enter(&self, entry: UserEntry) -> ! {
        let ss = u64::from(entry.data_selector.to_u16());
        let cs = u64::from(entry.code_selector.to_u16());
        let rsp = entry.stack_pointer.as_u64();
        let rip = entry.instruction_pointer.as_u64();
        let arg = entry.argument.as_u64();

        unsafe {
            asm!(
                "mov ds, {ss:x}",
                "mov es, {ss:x}",
                "push {ss}",
                "push {rsp}",
                "push {rflags}",
                "push {cs}",
                "push {rip}",
                "iretq",
                ss = in(reg) ss,
                rsp = in(reg) rsp,
                rflags = in(reg) USER_RFLAGS,
                cs = in(reg) cs,
                rip = in(reg) rip,
                in("rdi") arg,
                options(noreturn)
            )
        }
    }
}

/// Disable interrupts and halt the CPU for good.
pub fn halt_forever() -> ! {
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
    }
}

/// Launch `module` with the hardware trampoline.
///
/// Returns only for a recoverable failure, with the previous user image
/// still in place. A fatal failure is logged and the CPU is halted.
///
/// # Safety
/// See [`Launcher::launch`].
pub unsafe fn launch_or_halt<V, I>(
    launcher: &mut Launcher<'_, V, I>,
    module: &BootModule<'_>,
    argument: Option<&[u8]>,
) -> LaunchError
where
    V: VirtualMemory + ?Sized,
    I: InterruptControl + ?Sized,
{
    let Err(err) = unsafe { launcher.launch(module, argument, &IretqTrampoline) };
    if err.is_fatal() {
        error!("Previous user image is gone and the new one is incomplete, halting: {err}");
        halt_forever();
    }
    warn!("Launch rejected, previous image kept: {err}");
    err
}

/// Copy `src` to `dst` through the currently active mappings.
///
/// # Safety
/// `[dst, dst + src.len())` must be mapped in the active address space,
/// writable at CPL 0 (or `CR0.WP` clear) and not overlap `src`.
pub unsafe fn copy_into_active_space(dst: VirtualAddress, src: &[u8]) {
    trace!("Copying {} bytes to {dst}", src.len());
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr::<u8>(), src.len());
    }
}

/// Zero `[dst, dst + len)` through the currently active mappings.
///
/// # Safety
/// As for [`copy_into_active_space`].
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn zero_in_active_space(dst: VirtualAddress, len: u64) {
    unsafe {
        core::ptr::write_bytes(dst.as_mut_ptr::<u8>(), 0, len as usize);
    }
}
