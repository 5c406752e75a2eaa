//! x86_64 context switching implementation
//!
//! Uses inline naked assembly (stable since Rust 1.88).

use crate::arch::SwitchContext;
use std::arch::naked_asm;

/// Prepare a fresh context so the first switch into it lands in the entry
/// trampoline with `entry_fn(entry_arg)` ready to run on `stack_top`.
///
/// # Safety
///
/// `regs` must point to writable `SwitchContext` memory. `stack_top` must
/// be the high end of a live stack block at least a few KiB deep.
#[inline]
pub unsafe fn init_context(
    regs: *mut SwitchContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // System V AMD64: the trampoline is entered by `jmp` with this rsp,
    // and its `call` into the body pushes the return address that gives
    // the body the ABI-mandated entry parity (rsp % 16 == 8). So rsp must
    // be exactly 16-byte aligned here — no extra offset.
    let sp = stack_top as usize;
    let aligned_sp = sp & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64; // body wrapper
    regs.r13 = entry_arg as u64; // coroutine pointer
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First instruction every coroutine executes: forwards the stashed
/// argument and calls the body wrapper. The wrapper finishes with a final
/// yield and never returns here; falling through means a finished
/// coroutine was switched into without being re-armed.
#[unsafe(naked)]
pub unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {dead_resume}",
        "ud2",
        dead_resume = sym dead_resume_guard,
    );
}

/// Swap execution state: save callee-saved registers into `old`, load
/// from `new`, jump.
///
/// # Safety
///
/// Both pointers must reference valid `SwitchContext` memory; `new` must
/// hold either a context captured by a previous swap or one built by
/// [`init_context`]. Must not be called reentrantly for the same `old`.
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context(_old: *mut SwitchContext, _new: *const SwitchContext) {
    naked_asm!(
        // Save callee-saved registers into old (RDI)
        "mov [rdi + 0x00], rsp",
        // Label 2 (not 1): all-0/1 numeric labels clash with binary
        // literals under Intel syntax.
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "2:",
        "ret",
    );
}

/// Reached only if a completed body returns control to the trampoline,
/// i.e. someone bypassed the resumable flag. The stack above us is gone;
/// all we can do is say so and abort.
extern "C" fn dead_resume_guard() {
    corio_core::cerror!("finished coroutine switched into without re-arm; aborting");
    std::process::abort();
}
