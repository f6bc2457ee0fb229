//! Per-thread enable flag for the hooked-syscall layer.
//!
//! The dispatch loop turns the flag on for every thread it drives. A
//! syscall-hooking layer built on top of the scheduler consults it to
//! decide whether a blocking call should be intercepted and turned into
//! a fiber switch; threads outside any scheduler keep it off and go
//! straight to the OS.

use std::cell::Cell;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether hooked syscalls are active on the calling thread.
#[inline(always)]
pub fn enabled() -> bool {
    HOOK_ENABLED.with(|f| f.get())
}

/// Turns hooked syscalls on or off for the calling thread.
#[inline(always)]
pub fn set_enabled(on: bool) {
    HOOK_ENABLED.with(|f| f.set(on))
}
