//! Stackful coroutines (fibers) and the per-thread fiber anchors.
//!
//! A fiber owns a stack, a saved machine context and a callable, and is
//! driven explicitly: [`Fiber::resume`] switches the calling thread into
//! the fiber, [`yield_now`] switches back out. There is no preemption;
//! within one thread exactly one fiber runs at a time and control moves
//! only at these two points.
//!
//! The first fiber touched on a thread is that thread's *main fiber*: it
//! wraps the already-running native stack and is created lazily by
//! [`current`]. Under a [scheduler](crate::scheduler) each worker also
//! has a *scheduling fiber* (for plain workers it is the main fiber)
//! which runs the dispatch loop; a task fiber's yield returns control
//! there.
//!
//! Example:
//! ```no_run
//! use strand::fiber::{self, Fiber, FiberState};
//!
//! let fiber = Fiber::new(|| {
//!     println!("step one");
//!     fiber::yield_now();
//!     println!("step two");
//! }).unwrap();
//!
//! fiber.resume(); // prints "step one"
//! assert_eq!(fiber.state(), FiberState::Ready);
//! fiber.resume(); // prints "step two"
//! assert_eq!(fiber.state(), FiberState::Term);
//! ```

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::scheduler;

/// Fallback default for the per-fiber stack size, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack the allocator will hand out.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

const STACK_ALIGN: usize = 16;

static DEFAULT_STACK: Lazy<usize> = Lazy::new(|| {
    std::env::var("STRAND_FIBER_STACK_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&v| v >= MIN_STACK_SIZE)
        .unwrap_or(DEFAULT_STACK_SIZE)
});

/// The configured default stack size: the `STRAND_FIBER_STACK_SIZE`
/// environment variable if set and valid, [`DEFAULT_STACK_SIZE`]
/// otherwise.
#[inline(always)]
pub fn default_stack_size() -> usize {
    *DEFAULT_STACK
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of fibers currently alive in the process, main fibers included.
#[inline(always)]
pub fn count() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Fiber>> = RefCell::new(None);
    /// The fiber wrapping this thread's native stack.
    static THREAD_MAIN: RefCell<Option<Fiber>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// FiberState
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle state of a [`Fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset and not yet started, or suspended at a yield.
    Ready = 0,
    /// Currently executing on some thread.
    Running = 1,
    /// The callable returned; the fiber must not be resumed again.
    Term = 2,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Term,
            _ => unreachable!("invalid fiber state {v}"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberAttr
////////////////////////////////////////////////////////////////////////////////

/// Fiber construction attributes.
///
/// Currently the only attribute is the stack size. It is safe to drop a
/// `FiberAttr` while fibers created with it still exist.
#[derive(Debug, Clone)]
pub struct FiberAttr {
    stack_size: usize,
}

impl FiberAttr {
    /// Attributes with the [configured default](default_stack_size)
    /// stack size.
    #[inline(always)]
    pub fn new() -> Self {
        Self {
            stack_size: default_stack_size(),
        }
    }

    /// Stack size in bytes for fibers created with these attributes.
    #[inline(always)]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Sets the stack size (in bytes) for fibers created with these
    /// attributes. Fails with [`Error::InvalidStackSize`] below
    /// [`MIN_STACK_SIZE`].
    #[inline]
    pub fn set_stack_size(&mut self, stack_size: usize) -> Result<()> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidStackSize { size: stack_size });
        }
        self.stack_size = stack_size;
        Ok(())
    }
}

impl Default for FiberAttr {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Stack
////////////////////////////////////////////////////////////////////////////////

/// Heap stack buffer for one fiber. Allocated raw: the memory is written
/// by the fiber's machine code, never through references.
struct Stack {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Stack {
    fn alloc(size: usize) -> Result<Self> {
        let layout =
            Layout::from_size_align(size, STACK_ALIGN).map_err(|_| Error::StackAlloc { size })?;
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr, layout }),
            None => Err(Error::StackAlloc { size }),
        }
    }

    #[inline(always)]
    fn bottom(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A stackful coroutine.
///
/// `Fiber` is a cheap reference-counted handle; clones refer to the same
/// coroutine. The scheduler keeps a handle while a task is queued or
/// running, and user code may hold more.
///
/// # Thread safety
///
/// Handles can be sent and shared freely, but a fiber executes on at
/// most one thread at a time. [`resume`](Self::resume) asserts the
/// [`Ready`](FiberState::Ready) state, and the scheduler removes a task
/// from the shared queue under its mutex before resuming, so two threads
/// never drive the same stack concurrently. A suspended fiber may be
/// resumed on a different thread than the one it yielded on.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
}

struct FiberInner {
    id: u64,
    state: AtomicU8,
    /// `None` for a main fiber: it runs on the thread's native stack.
    stack: Option<Stack>,
    ctx: UnsafeCell<Context>,
    job: Cell<Option<Job>>,
    /// Set by the trampoline right before its final switch; the resuming
    /// side turns it into the `Term` state once the switch has landed.
    finished: Cell<bool>,
    /// Whether yields return to the scheduling fiber (task fibers) or to
    /// the thread's main fiber (the caller-mode root fiber).
    run_in_scheduler: bool,
    started: Cell<bool>,
}

// SAFETY: the interior cells are only touched by the thread currently
// driving the fiber; ownership moves between threads through the
// scheduler's queue mutex (or equivalent user synchronization), which
// orders those accesses. `state` is atomic and stays readable anywhere.
unsafe impl Send for FiberInner {}
unsafe impl Sync for FiberInner {}

impl Fiber {
    /// Creates a fiber running `f` with default attributes. Its yields
    /// will return control to the scheduling fiber of whatever thread
    /// resumes it.
    #[inline]
    pub fn new<F>(f: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_attr(&FiberAttr::new(), true, f)
    }

    /// Creates a fiber running `f` on a freshly allocated stack of
    /// `attr.stack_size()` bytes.
    ///
    /// `run_in_scheduler` picks the target of the fiber's yields: `true`
    /// (the normal case) returns control to the scheduling fiber of the
    /// resuming thread, `false` to that thread's main fiber. The only
    /// `false` user is the scheduler's caller-mode root fiber, which
    /// must hand the caller thread back to ordinary code when it is done.
    pub fn with_attr<F>(attr: &FiberAttr, run_in_scheduler: bool, f: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_job(attr, run_in_scheduler, Box::new(f))
    }

    pub(crate) fn from_job(attr: &FiberAttr, run_in_scheduler: bool, job: Job) -> Result<Self> {
        let stack = Stack::alloc(attr.stack_size())?;
        let mut ctx = Context::empty();
        // SAFETY: the stack moves into the fiber below and lives as long
        // as the context.
        unsafe { ctx.make(stack.bottom(), stack.len(), trampoline) };

        let fiber = Fiber {
            inner: Arc::new(FiberInner {
                id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
                state: AtomicU8::new(FiberState::Ready as u8),
                stack: Some(stack),
                ctx: UnsafeCell::new(ctx),
                job: Cell::new(Some(job)),
                finished: Cell::new(false),
                run_in_scheduler,
                started: Cell::new(false),
            }),
        };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::debug!("fiber {} created", fiber.id());
        Ok(fiber)
    }

    /// Wraps the calling thread's native stack as its main fiber.
    fn new_main() -> Self {
        let fiber = Fiber {
            inner: Arc::new(FiberInner {
                id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
                state: AtomicU8::new(FiberState::Running as u8),
                stack: None,
                ctx: UnsafeCell::new(Context::empty()),
                job: Cell::new(None),
                finished: Cell::new(false),
                run_in_scheduler: false,
                started: Cell::new(true),
            }),
        };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        fiber
    }

    /// Process-unique id of this fiber.
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state. Readable from any thread.
    #[inline(always)]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    fn set_state(&self, state: FiberState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Switches the calling thread into this fiber. Returns when the
    /// fiber yields or its callable returns; [`state`](Self::state) then
    /// tells which of the two happened.
    ///
    /// Must be called from the fiber's yield target — the scheduling (or
    /// main) fiber of the calling thread — and the fiber must be
    /// [`Ready`](FiberState::Ready). Violating either is a contract
    /// violation and aborts. The caller must keep a handle alive for the
    /// duration of the call, which holding `&self` already guarantees.
    pub fn resume(&self) {
        assert!(
            self.state() == FiberState::Ready,
            "resume of a non-READY fiber (id {}, state {:?})",
            self.id(),
            self.state(),
        );
        let from = current();
        let target = self.yield_target();
        assert!(
            from == target,
            "fiber {} must be resumed from its yield target (fiber {}), not from fiber {}",
            self.id(),
            target.id(),
            from.id(),
        );

        self.set_state(FiberState::Running);
        self.inner.started.set(true);
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        // SAFETY: `from` is this thread's suspending fiber, its context
        // cell is written only here on this thread; `self` is Ready and
        // was claimed by this thread (asserted above).
        unsafe { Context::swap(from.ctx_ptr(), self.ctx_ptr()) };

        // Back on the suspending side. Only now is the fiber's context
        // fully saved, so only now may its new state become visible to
        // queue scans on other threads.
        if self.inner.finished.get() {
            self.set_state(FiberState::Term);
            log::debug!("fiber {} terminated", self.id());
        } else {
            self.set_state(FiberState::Ready);
        }
    }

    /// Re-arms a finished (or never started) fiber with a new callable
    /// on the same stack, avoiding allocator churn when one fiber slot
    /// serves many callables.
    ///
    /// The fiber must be [`Term`](FiberState::Term), or still
    /// [`Ready`](FiberState::Ready) and never resumed; anything else is
    /// a contract violation and aborts.
    #[inline]
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_job(Box::new(f))
    }

    pub(crate) fn reset_job(&self, job: Job) {
        let state = self.state();
        assert!(
            state == FiberState::Term || (state == FiberState::Ready && !self.inner.started.get()),
            "reset of fiber {} in state {:?}",
            self.id(),
            state,
        );
        let stack = self.inner.stack.as_ref().expect("reset of a main fiber");
        self.inner.job.set(Some(job));
        // SAFETY: the fiber is not running (asserted above), nothing
        // else references the context or the stack right now.
        unsafe { (*self.ctx_ptr()).make(stack.bottom(), stack.len(), trampoline) };
        self.inner.finished.set(false);
        self.inner.started.set(false);
        self.set_state(FiberState::Ready);
    }

    /// The fiber control returns to when this fiber yields on the
    /// calling thread.
    fn yield_target(&self) -> Fiber {
        if self.inner.run_in_scheduler {
            // Outside any scheduler the scheduling fiber and the main
            // fiber are the same thing.
            scheduler::current_scheduling_fiber().unwrap_or_else(thread_main)
        } else {
            thread_main()
        }
    }

    #[inline(always)]
    fn ctx_ptr(&self) -> *mut Context {
        self.inner.ctx.get()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Fiber {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fiber {}

impl Hash for Fiber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state)
    }
}

impl Drop for FiberInner {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let state = FiberState::from_u8(*self.state.get_mut());
        if self.stack.is_some() && self.started.get() && state != FiberState::Term {
            // The frames suspended on the stack are abandoned, not
            // unwound; anything they own is leaked.
            log::warn!("fiber {} dropped while suspended", self.id);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Per-thread anchors
////////////////////////////////////////////////////////////////////////////////

/// The fiber currently executing on the calling thread.
///
/// On a thread that has not used fibers yet this lazily wraps the native
/// stack as the thread's main fiber and returns it.
pub fn current() -> Fiber {
    if let Some(f) = try_current() {
        return f;
    }
    thread_main()
}

/// Like [`current`] but without creating the main fiber. Also safe
/// during thread-local destruction (the logger calls this on any thread,
/// at any point of its lifetime).
pub(crate) fn try_current() -> Option<Fiber> {
    CURRENT.try_with(|c| c.borrow().clone()).ok().flatten()
}

/// The calling thread's main fiber, created on first use. Until
/// something is resumed it is also the current fiber.
fn thread_main() -> Fiber {
    if let Some(f) = THREAD_MAIN.with(|m| m.borrow().clone()) {
        return f;
    }
    let main = Fiber::new_main();
    log::debug!("thread main fiber {} created", main.id());
    THREAD_MAIN.with(|m| *m.borrow_mut() = Some(main.clone()));
    CURRENT.with(|c| {
        let mut c = c.borrow_mut();
        if c.is_none() {
            *c = Some(main.clone());
        }
    });
    main
}

/// Suspends the fiber currently executing on the calling thread and
/// returns control to its yield target: the scheduling fiber under a
/// scheduler, the thread's main fiber otherwise. Returns when the fiber
/// is next resumed, possibly on another thread.
///
/// A yielded fiber is *not* re-queued automatically; to run again under
/// a scheduler it must be re-submitted (see
/// [`Task::fiber`](crate::scheduler::Task::fiber)).
///
/// Calling this from the yield target itself (ordinary code outside any
/// fiber, or a scheduling fiber between tasks) is a no-op.
pub fn yield_now() {
    let cur = current();
    let target = cur.yield_target();
    if cur == target {
        return;
    }
    assert!(
        cur.state() == FiberState::Running,
        "yield of a non-RUNNING fiber (id {}, state {:?})",
        cur.id(),
        cur.state(),
    );
    CURRENT.with(|c| *c.borrow_mut() = Some(target.clone()));
    // The Ready state is published by the resuming side once this swap
    // has landed there; until then queue scans keep skipping the fiber.
    // SAFETY: `cur` is running on this thread and `target` is this
    // thread's suspended scheduling/main fiber.
    unsafe { Context::swap(cur.ctx_ptr(), target.ctx_ptr()) };
}

////////////////////////////////////////////////////////////////////////////////
// Trampoline
////////////////////////////////////////////////////////////////////////////////

/// Entry point at the bottom of every fiber stack: runs the callable,
/// guards against escaping panics, then switches back out for good.
extern "C" fn trampoline() {
    let cur = current();
    let id = cur.id();
    let job = cur
        .inner
        .job
        .take()
        .expect("fiber started without a callable");
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        log::error!(
            "fiber {} callable panicked: {}",
            id,
            panic_message(payload.as_ref()),
        );
    }

    cur.inner.finished.set(true);
    let target = cur.yield_target();
    CURRENT.with(|c| *c.borrow_mut() = Some(target.clone()));

    // This frame is abandoned by the switch below and never unwound, so
    // the handles must be dropped by hand first. The raw pointers stay
    // valid: CURRENT keeps the target alive, the resumer's handle keeps
    // this fiber alive.
    let raw_cur: *const FiberInner = Arc::as_ptr(&cur.inner);
    let raw_target: *const FiberInner = Arc::as_ptr(&target.inner);
    drop(target);
    drop(cur);
    unsafe { Context::swap((*raw_cur).ctx.get(), (*raw_target).ctx.get()) };

    unreachable!("terminated fiber {} was resumed", id);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn resume_and_yield_round_trip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let fiber = {
            let steps = steps.clone();
            Fiber::new(move || {
                steps.fetch_add(1, Ordering::Relaxed);
                yield_now();
                steps.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
        };

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::Relaxed), 1);
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::Relaxed), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn ids_are_process_unique() {
        let fibers: Vec<_> = (0..64).map(|_| Fiber::new(|| {}).unwrap()).collect();
        let mut ids: Vec<_> = fibers.iter().map(|f| f.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn main_fiber_wraps_the_thread() {
        let a = current();
        let b = current();
        assert_eq!(a, b);
        assert_eq!(a.state(), FiberState::Running);
        assert_eq!(a.id(), crate::util::fiber_id());
    }

    #[test]
    fn reset_reuses_the_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let fiber = {
            let hits = hits.clone();
            Fiber::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
        };
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let hits2 = hits.clone();
        fiber.reset(move || {
            hits2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn panic_in_callable_terminates_the_fiber() {
        let fiber = Fiber::new(|| panic!("boom")).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        // The thread is still usable for other fibers.
        let ok = Fiber::new(|| {}).unwrap();
        ok.resume();
        assert_eq!(ok.state(), FiberState::Term);
    }

    #[test]
    fn yield_outside_a_fiber_is_a_noop() {
        yield_now();
        yield_now();
    }

    #[test]
    fn custom_stack_size() {
        let mut attr = FiberAttr::new();
        attr.set_stack_size(MIN_STACK_SIZE).unwrap();
        assert!(attr.set_stack_size(1024).is_err());
        assert_eq!(attr.stack_size(), MIN_STACK_SIZE);

        let ran = Arc::new(AtomicUsize::new(0));
        let fiber = {
            let ran = ran.clone();
            Fiber::with_attr(&attr, true, move || {
                ran.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
        };
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }
}
