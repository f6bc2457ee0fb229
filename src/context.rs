//! Machine-context save/restore on top of the POSIX `ucontext` family.
//!
//! A [`Context`] holds the callee-saved register file, stack pointer and
//! instruction pointer of a suspended execution. [`Context::make`] arms a
//! context so that the next swap into it starts a fresh entry function on
//! a caller-provided stack; [`Context::swap`] suspends the running
//! execution into one context and continues from another.
//!
//! Memory written before a swap is visible after control returns to the
//! same context on the same thread. Nothing here synchronizes across
//! threads: moving a suspended context to another thread must be ordered
//! externally (the scheduler's queue mutex does this for fibers).

use std::io;
use std::mem::MaybeUninit;
use std::ptr;

pub(crate) struct Context {
    inner: libc::ucontext_t,
}

impl Context {
    /// A context that has never been executed. Valid only as the save
    /// side of a [`swap`](Self::swap) or as the target of
    /// [`make`](Self::make).
    pub(crate) fn empty() -> Self {
        // ucontext_t is a plain C struct; getcontext/swapcontext fill it
        // before it is ever read.
        Self {
            inner: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }

    /// Arms the context so that the next swap into it calls `entry` at
    /// the top of the `stack_len`-byte stack at `stack_bottom`.
    ///
    /// `entry` must never return: an armed context has no link to fall
    /// back to.
    ///
    /// # Safety
    ///
    /// The stack must stay allocated for as long as the context (or an
    /// execution suspended within it) is alive.
    pub(crate) unsafe fn make(
        &mut self,
        stack_bottom: *mut u8,
        stack_len: usize,
        entry: extern "C" fn(),
    ) {
        if libc::getcontext(&mut self.inner) != 0 {
            panic!("getcontext failed: {}", io::Error::last_os_error());
        }
        self.inner.uc_link = ptr::null_mut();
        self.inner.uc_stack.ss_sp = stack_bottom.cast();
        self.inner.uc_stack.ss_size = stack_len;
        self.inner.uc_stack.ss_flags = 0;
        libc::makecontext(&mut self.inner, entry, 0);
    }

    /// Saves the running execution into `from` and continues from `to`.
    /// Returns when something swaps back into `from`.
    ///
    /// # Safety
    ///
    /// `to` must hold a live suspended execution or be armed via
    /// [`make`](Self::make), and no other thread may touch either
    /// context during the call.
    pub(crate) unsafe fn swap(from: *mut Context, to: *const Context) {
        if libc::swapcontext(&mut (*from).inner, &(*to).inner) != 0 {
            panic!("swapcontext failed: {}", io::Error::last_os_error());
        }
    }
}
