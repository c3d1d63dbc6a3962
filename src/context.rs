//! Machine context save/restore.
//!
//! This is the primitive beneath [`crate::fiber::Fiber::resume`] and
//! [`crate::fiber::Fiber::yield_now`]: a symmetric stack-pointer swap that
//! saves the outgoing callee-saved register block onto its own stack and
//! restores the incoming one. See spec §9: a hand-rolled asm stack swap
//! avoids the signal-mask save/restore that `ucontext`-based primitives pay
//! for on every switch.
//!
//! Only the stack pointer is threaded through Rust; the register save/restore
//! happens entirely in `swap_context`, written in raw assembly per
//! architecture. Interior mutability (`Cell`) lets a `Context` live behind a
//! shared `Arc<Fiber>`, since resume/yield never need `&mut` access from more
//! than one place at a time (enforced by the scheduler's single-owner
//! protocol, not by the type system).

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;
use std::ptr;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "macos")))] {
        #[path = "context/x86_64.rs"]
        mod imp;
    } else if #[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))] {
        #[path = "context/aarch64.rs"]
        mod imp;
    } else {
        compile_error!("corort: unsupported target for stackful context switching");
    }
}

/// Default stack size for a newly constructed fiber: 128 KiB (spec §3).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// A fiber's private stack. Allocated once at construction and reused across
/// [`Context::reset`] calls; freed when the owning fiber is dropped.
struct Stack {
    ptr: *mut u8,
    len: usize,
}

// Safety: a `Stack` is only ever touched through the owning `Fiber`, which is
// moved, never aliased, across threads per the scheduler's single-owner
// invariant.
unsafe impl Send for Stack {}

impl Stack {
    fn new(size: usize) -> Self {
        let size = size.max(imp::MIN_STACK_SIZE);
        let layout =
            Layout::from_size_align(size, imp::STACK_ALIGN).expect("invalid fiber stack size");
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null(), "failed to allocate fiber stack");
        Stack { ptr, len: size }
    }

    /// Address one past the last byte of the stack (stacks grow down).
    fn top(&self) -> *mut u8 {
        unsafe { self.ptr.add(self.len) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, imp::STACK_ALIGN).unwrap();
        unsafe { dealloc(self.ptr, layout) };
    }
}

/// A saved machine context: a private stack plus the stack pointer at which
/// execution is parked.
///
/// `sp` holds the parked stack pointer: the bootstrap entry written by
/// `init_stack` before the first resume, or the point `swap()` saved on the
/// previous yield thereafter. It is `None` only while this context is the
/// one actively running, from the moment `swap()` takes it to the moment a
/// later `swap()` restores it.
pub struct Context {
    stack: Stack,
    sp: Cell<Option<ptr::NonNull<u8>>>,
}

// Safety: see `Stack`.
unsafe impl Send for Context {}

impl Context {
    /// Allocates a stack and prepares it so that the first resume enters
    /// `trampoline(arg)`.
    pub fn new(stack_size: usize, trampoline: extern "C" fn(usize) -> !, arg: usize) -> Self {
        let stack = Stack::new(stack_size);
        let sp = unsafe { imp::init_stack(stack.top(), trampoline, arg) };
        Context {
            stack,
            sp: Cell::new(Some(sp)),
        }
    }

    /// Re-initializes a terminated context's stack with a new trampoline
    /// entry, reusing the allocation. Caller must ensure the context is
    /// `TERM` (not suspended mid-execution).
    pub fn reset(&self, trampoline: extern "C" fn(usize) -> !, arg: usize) {
        let sp = unsafe { imp::init_stack(self.stack.top(), trampoline, arg) };
        self.sp.set(Some(sp));
    }

    /// Swaps execution from `self` (the caller, currently running) into
    /// `target`. Does not return until some context swaps back into `self`.
    ///
    /// # Safety
    /// `target` must hold a valid parked or freshly-initialized stack
    /// pointer, and must not be resumed concurrently from another thread.
    pub unsafe fn swap(&self, target: &Context) {
        let new_sp = target
            .sp
            .take()
            .expect("swap into a context that is already running")
            .as_ptr();
        let mut old_sp: *mut u8 = ptr::null_mut();
        imp::swap_context(&mut old_sp, new_sp);
        self.sp.set(ptr::NonNull::new(old_sp));
    }
}
