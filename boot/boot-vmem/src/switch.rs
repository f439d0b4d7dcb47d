//! # Address-Space Switch
//!
//! The one-shot, irreversible handoff from the firmware-provided identity
//! mapping to a hierarchy built with [`AddressSpace::map_range`]: new CR3,
//! new stack, then straight into the continuation. There is no path back:
//! once CR3 is loaded the previous mapping is unreachable unless the new
//! hierarchy explicitly preserved it.
//!
//! The whole transition is a single `asm!` block. Loading CR3 changes
//! translation for the *next instruction fetch* as well as for data, so no
//! memory access may sit between the steps that is not mapped identically in
//! both the old and the new hierarchy. In practice the loader satisfies this
//! by identity-mapping its own image before switching.
//!
//! [`AddressSpace::map_range`]: crate::AddressSpace::map_range

#[cfg(target_arch = "x86_64")]
use crate::{PhysAddr, VirtAddr};

/// Activate `new_root` and continue at `entry` on a fresh stack.
///
/// Required order, as one inseparable sequence:
///
/// 1. interrupts off; nothing may fire between the two worlds;
/// 2. CR3 ← `new_root`: all further accesses translate through the new
///    hierarchy;
/// 3. RSP ← `stack_top`, RBP ← 0: the first frame on the new stack has no
///    caller frame to unwind into;
/// 4. push a zero return-address slot and jump to `entry` with `arg` in the
///    first sysv64 argument register. `entry` never returns.
///
/// # Safety
///
/// No validation is performed. The caller must have built `new_root` so that
/// it maps (a) the page containing this very code, (b) the stack region
/// ending at `stack_top`, and (c) everything `entry` touches. Violating any
/// of these is an unrecoverable hardware fault, not a reported error.
/// `stack_top` must be 16-byte aligned per the sysv64 ABI.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub unsafe fn activate(new_root: PhysAddr, stack_top: VirtAddr, entry: VirtAddr, arg: u64) -> ! {
    unsafe {
        core::arch::asm!(
            "cli",
            // New translation root; next fetch already goes through it.
            "mov    cr3, rdi",
            // Relocate onto the new stack.
            "mov    rsp, rdx",
            // Fresh call-stack base.
            "xor    ebp, ebp",
            // sysv64 arg0 for the continuation.
            "mov    rdi, r8",
            // Dummy return slot; the continuation never returns.
            "push   0",
            "jmp    rsi",
            in("rdi") new_root.as_u64(),
            in("rsi") entry.as_u64(),
            in("rdx") stack_top.as_u64(),
            in("r8") arg,
            options(noreturn)
        )
    }
}
