//! x86_64 System V stack bootstrap and context swap.
//!
//! Callee-saved integer registers (`rbp`, `rbx`, `r12`-`r15`) are the only
//! state preserved across a swap; everything else is caller-saved per the
//! ABI and is the responsibility of whichever Rust frame called `swap`.

use std::arch::global_asm;
use std::mem::size_of;
use std::ptr::NonNull;

pub const MIN_STACK_SIZE: usize = 4096 * 4;
pub const STACK_ALIGN: usize = 16;

extern "C" {
    fn corort_swap_context(old_sp_out: *mut *mut u8, new_sp: *mut u8);
    fn corort_bootstrap();
}

/// Saves the outgoing callee-saved registers and `rsp` into `*old_sp_out`,
/// then restores `rsp` from `new_sp` and pops the incoming registers.
#[inline]
pub unsafe fn swap_context(old_sp_out: *mut *mut u8, new_sp: *mut u8) {
    corort_swap_context(old_sp_out, new_sp)
}

/// Lays out a fresh stack so that the first `swap_context` into it lands in
/// `trampoline(arg)`.
///
/// The 6 callee-saved slots are consumed by `corort_swap_context`'s epilogue;
/// the return address left for `ret` points at `corort_bootstrap`, a tiny
/// shim that loads `arg` into `rdi` (the first SysV integer argument
/// register) and jumps into `trampoline` — it never itself returns, so no
/// stack space is reserved for it.
pub unsafe fn init_stack(
    top: *mut u8,
    trampoline: extern "C" fn(usize) -> !,
    arg: usize,
) -> NonNull<u8> {
    // 6 callee-saved regs + return address + (arg, fn ptr) for the bootstrap
    // shim + 1 pad word to restore the "as if called" 16n+8 alignment that
    // `ret`/`jmp` (as opposed to `call`) would otherwise break.
    const WORDS: usize = 10;
    let base = (top as usize) & !(STACK_ALIGN - 1);
    let sp = (base - WORDS * size_of::<usize>()) as *mut usize;
    for i in 0..6 {
        sp.add(i).write(0);
    }
    sp.add(6).write(corort_bootstrap as usize);
    sp.add(7).write(arg);
    sp.add(8).write(trampoline as usize);
    NonNull::new_unchecked(sp as *mut u8)
}

global_asm!(
    ".text",
    ".global corort_swap_context",
    ".p2align 4",
    "corort_swap_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".global corort_bootstrap",
    ".p2align 4",
    "corort_bootstrap:",
    "pop rdi",
    "pop rax",
    "jmp rax",
);
