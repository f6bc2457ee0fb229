//! Work-queue M:N scheduler: multiplexes submitted tasks onto a pool of
//! worker threads, each driving fibers through a dispatch loop.
//!
//! Callers submit [`Task`]s — plain callables or ready [`Fiber`]s,
//! optionally pinned to one worker's OS thread id — into a FIFO queue
//! shared by all workers under one mutex. Every worker runs the dispatch
//! loop on its *scheduling fiber*: claim a task, resume it, and when it
//! yields or finishes go pick the next one. With no claimable task the
//! worker resumes its *idle fiber*, which by default spins (yielding
//! between polls) until shutdown; the [`Hooks`] trait lets an I/O layer
//! replace that busy-poll with a real wait primitive.
//!
//! In *caller mode* the constructing thread fills one pool slot itself.
//! It keeps doing unrelated work after [`Scheduler::start`]; only inside
//! [`Scheduler::stop`] does it dispatch, on a dedicated *root fiber*,
//! draining the queue before `stop` returns.
//!
//! Example:
//! ```no_run
//! use strand::scheduler::{Scheduler, Task};
//!
//! let sched = Scheduler::new(4, false, "pool");
//! sched.start().unwrap();
//! sched.schedule(Task::call(|| println!("hi from a fiber"))).unwrap();
//! sched.stop();
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, FiberAttr, FiberState, Job};
use crate::hook;
use crate::util;

thread_local! {
    /// The scheduler owning this thread's dispatch loop.
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
    /// The fiber running the dispatch loop on this thread. For plain
    /// workers this is the thread's main fiber; for the caller thread it
    /// is the root fiber.
    static SCHEDULING_FIBER: RefCell<Option<Fiber>> = RefCell::new(None);
}

/// Scheduling fiber of the calling thread, if a dispatch loop owns it.
pub(crate) fn current_scheduling_fiber() -> Option<Fiber> {
    SCHEDULING_FIBER.with(|f| f.borrow().clone())
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

enum Payload {
    Fiber(Fiber),
    Call(Job),
}

/// A unit of work for a [`Scheduler`]: either a callable the scheduler
/// wraps in a (reused) fiber, or a ready fiber to resume. Optionally
/// pinned to one worker's OS thread id.
pub struct Task {
    payload: Payload,
    thread: Option<u64>,
}

impl Task {
    /// A task running the callable `f`.
    #[inline]
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            payload: Payload::Call(Box::new(f)),
            thread: None,
        }
    }

    /// A task resuming `fiber`, which must be
    /// [`Ready`](FiberState::Ready) by the time a worker claims it.
    #[inline]
    pub fn fiber(fiber: Fiber) -> Self {
        Self {
            payload: Payload::Fiber(fiber),
            thread: None,
        }
    }

    /// Pins the task to the worker with the OS thread id `thread_id`
    /// (see [`Scheduler::thread_ids`]). Other workers skip it; pinned
    /// tasks reach their thread in submission order.
    #[inline]
    pub fn on_thread(mut self, thread_id: u64) -> Self {
        self.thread = Some(thread_id);
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Task");
        match &self.payload {
            Payload::Fiber(fiber) => s.field("fiber", &fiber.id()),
            Payload::Call(_) => s.field("call", &".."),
        };
        s.field("thread", &self.thread).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Hooks
////////////////////////////////////////////////////////////////////////////////

/// Extension points of the dispatch loop.
///
/// The defaults implement the busy-polling core: `tickle` is only a log
/// point and `idle` spins, yielding between polls. A layer with real
/// wakeups (an eventfd, a condition variable, an I/O reactor) installs
/// its own implementation via [`Scheduler::with_hooks`]; the dispatch
/// protocol itself does not change.
pub trait Hooks: Send + Sync + 'static {
    /// Notifies workers that work may be available: called after a push
    /// into an empty queue, after a scan that left claimable tasks
    /// behind, and `threads + 1` times by [`Scheduler::stop`]. Must make
    /// sure at least one worker re-enters its queue scan soon — which
    /// the busy-polling default satisfies vacuously.
    fn tickle(&self, sched: &Scheduler) {
        log::debug!("scheduler `{}` tickle", sched.name());
    }

    /// Body of the per-worker idle fiber, entered whenever a worker
    /// finds no claimable task. Must return only once
    /// [`Scheduler::stopping`] holds: the idle fiber reaching
    /// [`Term`](FiberState::Term) is the dispatch loop's shutdown
    /// signal.
    fn idle(&self, sched: &Scheduler) {
        log::debug!("scheduler `{}` idle", sched.name());
        while !sched.stopping() {
            fiber::yield_now();
        }
    }

    /// Whether the scheduler has fully stopped: shutdown requested, no
    /// queued tasks and no worker busy with one.
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.stop_requested() && sched.pending_tasks() == 0 && sched.active_threads() == 0
    }
}

/// The busy-polling defaults.
struct DefaultHooks;

impl Hooks for DefaultHooks {}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

struct State {
    tasks: VecDeque<Task>,
    stopping: bool,
    threads: Vec<JoinHandle<()>>,
    thread_ids: Vec<u64>,
}

struct Inner {
    name: String,
    /// Worker threads to spawn; the caller's slot is already subtracted.
    thread_count: usize,
    use_caller: bool,
    /// OS thread id of the caller, when it participates.
    root_thread: Option<u64>,
    /// Caller-mode scheduling fiber. Runs the dispatch loop on the
    /// caller thread once `stop` resumes it.
    root_fiber: OnceCell<Fiber>,
    state: Mutex<State>,
    /// Workers currently executing a task fiber.
    active_threads: AtomicUsize,
    /// Workers currently inside their idle fiber.
    idle_threads: AtomicUsize,
    hooks: Box<dyn Hooks>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        log::debug!("scheduler `{}` dropped", self.name);
    }
}

/// The M:N dispatcher. See the [module docs](self) for the protocol.
///
/// `Scheduler` is a cheap reference-counted handle; clones refer to the
/// same scheduler, and every worker thread owns one. Call
/// [`stop`](Self::stop) before dropping the last user handle — workers
/// never exit on their own, and in caller mode `stop` is also what
/// releases the caller thread for a future scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler named `name` over `threads` ≥ 1 threads.
    ///
    /// With `use_caller` the constructing thread is counted as one of
    /// the `threads` and participates in dispatch, but only from inside
    /// [`stop`](Self::stop). Construction then reserves the thread's
    /// main fiber, allocates the root scheduling fiber, renames the
    /// thread and registers it with the scheduler; a thread can host at
    /// most one caller-mode scheduler at a time.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        Self::with_hooks(threads, use_caller, name, DefaultHooks)
    }

    /// [`new`](Self::new) with the dispatch-loop extension points
    /// overridden (see [`Hooks`]).
    pub fn with_hooks<H>(threads: usize, use_caller: bool, name: &str, hooks: H) -> Self
    where
        H: Hooks,
    {
        assert!(threads >= 1, "scheduler needs at least one thread");

        let mut thread_count = threads;
        let mut root_thread = None;
        if use_caller {
            // The caller fills one pool slot itself.
            thread_count -= 1;
            root_thread = Some(util::thread_id());
        }

        let sched = Scheduler {
            inner: Arc::new(Inner {
                name: name.into(),
                thread_count,
                use_caller,
                root_thread,
                root_fiber: OnceCell::new(),
                state: Mutex::new(State {
                    tasks: VecDeque::new(),
                    stopping: false,
                    threads: Vec::new(),
                    thread_ids: root_thread.into_iter().collect(),
                }),
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                hooks: Box::new(hooks),
            }),
        };

        if use_caller {
            // The caller's own main fiber must exist before the root
            // fiber can ever switch back to it.
            fiber::current();
            assert!(
                Scheduler::current().is_none(),
                "thread already hosts a scheduler, cannot construct `{name}` in caller mode",
            );
            CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(sched.clone()));

            // Weak, or the scheduler would own a fiber owning the
            // scheduler. The upgrade cannot fail: stop() resumes the
            // root fiber through a live handle.
            let weak = Arc::downgrade(&sched.inner);
            let root = Fiber::with_attr(&FiberAttr::new(), false, move || {
                let inner = weak.upgrade().expect("scheduler gone before its root fiber ran");
                Scheduler { inner }.run();
            })
            .expect("failed to allocate the root scheduling fiber");
            SCHEDULING_FIBER.with(|f| *f.borrow_mut() = Some(root.clone()));
            util::set_thread_name(name);
            sched
                .inner
                .root_fiber
                .set(root)
                .expect("root fiber installed twice");
            log::debug!(
                "scheduler `{}` constructed in caller mode on thread {}",
                name,
                sched.inner.root_thread.unwrap_or(0),
            );
        }

        sched
    }

    /// The scheduler owning the calling thread's dispatch loop, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER.with(|s| s.borrow().clone())
    }

    /// The fiber running the dispatch loop on the calling thread, if any.
    pub fn scheduling_fiber() -> Option<Fiber> {
        current_scheduling_fiber()
    }

    /// Scheduler name; also the worker thread name prefix.
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// OS thread ids of all participating threads, the caller's first in
    /// caller mode. Complete once [`start`](Self::start) has returned;
    /// the ids are what [`Task::on_thread`] pins against.
    pub fn thread_ids(&self) -> Vec<u64> {
        self.lock().thread_ids.clone()
    }

    /// Whether [`stop`](Self::stop) has been requested.
    pub fn stop_requested(&self) -> bool {
        self.lock().stopping
    }

    /// Number of queued, not yet claimed tasks.
    pub fn pending_tasks(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Number of workers currently executing a task fiber.
    #[inline(always)]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Number of workers currently inside their idle fiber.
    #[inline(always)]
    pub fn idle_threads(&self) -> usize {
        self.inner.idle_threads.load(Ordering::Relaxed)
    }

    /// The shutdown predicate (virtual, see [`Hooks::stopping`]).
    #[inline]
    pub fn stopping(&self) -> bool {
        self.inner.hooks.stopping(self)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("scheduler state mutex poisoned")
    }

    fn tickle(&self) {
        self.inner.hooks.tickle(self);
    }

    /// Spawns the worker threads and returns once each has reported its
    /// OS thread id. In caller mode the caller does not start
    /// dispatching here — that happens inside [`stop`](Self::stop) — so
    /// the thread stays free for unrelated work.
    ///
    /// Starting after [`stop`](Self::stop) is rejected; starting twice
    /// is a contract violation and aborts.
    pub fn start(&self) -> Result<()> {
        log::debug!("scheduler `{}` start", self.name());
        let mut st = self.lock();
        if st.stopping {
            log::warn!("scheduler `{}` already stopping, start rejected", self.name());
            return Err(Error::Stopped {
                name: self.name().into(),
            });
        }
        assert!(st.threads.is_empty(), "scheduler `{}` started twice", self.name());

        let (id_tx, id_rx) = mpsc::channel();
        for i in 0..self.inner.thread_count {
            let sched = self.clone();
            let id_tx = id_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", self.name(), i))
                .spawn(move || {
                    // Report the OS id first: start() blocks on it.
                    let _ = id_tx.send(util::thread_id());
                    drop(id_tx);
                    sched.run();
                })?;
            st.threads.push(handle);
        }
        drop(id_tx);
        for _ in 0..self.inner.thread_count {
            let id = id_rx
                .recv()
                .expect("worker exited before reporting its thread id");
            st.thread_ids.push(id);
        }
        Ok(())
    }

    /// Submits one task. A push into an empty queue tickles the workers.
    ///
    /// Tasks submitted after [`stop`](Self::stop) are rejected with
    /// [`Error::Stopped`] and dropped.
    pub fn schedule(&self, task: Task) -> Result<()> {
        let need_tickle = {
            let mut st = self.lock();
            if st.stopping {
                log::warn!(
                    "scheduler `{}` is stopping, {:?} rejected",
                    self.name(),
                    task,
                );
                return Err(Error::Stopped {
                    name: self.name().into(),
                });
            }
            let was_empty = st.tasks.is_empty();
            st.tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
        Ok(())
    }

    /// Submits a batch of tasks under a single queue lock, preserving
    /// their order. Rejected like [`schedule`](Self::schedule) once the
    /// scheduler is stopping.
    pub fn schedule_batch<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut st = self.lock();
            if st.stopping {
                log::warn!("scheduler `{}` is stopping, batch rejected", self.name());
                return Err(Error::Stopped {
                    name: self.name().into(),
                });
            }
            let was_empty = st.tasks.is_empty();
            let before = st.tasks.len();
            st.tasks.extend(tasks);
            was_empty && st.tasks.len() > before
        };
        if need_tickle {
            self.tickle();
        }
        Ok(())
    }

    /// Stops the scheduler: already-queued tasks are drained, the idle
    /// fibers terminate and every worker thread is joined before this
    /// returns. Calling it again afterwards is a no-op.
    ///
    /// In caller mode `stop` must run on the caller thread, and it is
    /// here that the caller finally dispatches: the root fiber drains
    /// the queue before control comes back. Without caller mode `stop`
    /// must come from a thread outside the pool. The wrong thread class
    /// is a contract violation and aborts.
    pub fn stop(&self) {
        if self.stopping() {
            return;
        }
        log::debug!("scheduler `{}` stop", self.name());
        self.lock().stopping = true;

        let on_this = Scheduler::current()
            .map_or(false, |s| Arc::ptr_eq(&s.inner, &self.inner));
        if self.inner.use_caller {
            assert!(
                on_this && Some(util::thread_id()) == self.inner.root_thread,
                "caller-mode scheduler `{}` must be stopped from its caller thread",
                self.name(),
            );
        } else {
            assert!(
                !on_this,
                "scheduler `{}` must be stopped from outside its pool",
                self.name(),
            );
        }

        for _ in 0..self.inner.thread_count {
            self.tickle();
        }
        let root = self.inner.root_fiber.get();
        if root.is_some() {
            // One extra for the caller's own dispatch loop.
            self.tickle();
        }
        if let Some(root) = root {
            // The caller thread dispatches now; resume returns once the
            // queue is drained and the idle fiber has terminated.
            root.resume();
            log::debug!("scheduler `{}` root fiber finished", self.name());
        }

        let threads = std::mem::take(&mut self.lock().threads);
        for handle in threads {
            if handle.join().is_err() {
                log::error!("scheduler `{}` worker thread panicked", self.name());
            }
        }

        // Release the caller thread's anchors so it can host another
        // scheduler later.
        CURRENT_SCHEDULER.with(|s| {
            let mut s = s.borrow_mut();
            if s.as_ref().map_or(false, |c| Arc::ptr_eq(&c.inner, &self.inner)) {
                *s = None;
            }
        });
        if self.inner.use_caller {
            SCHEDULING_FIBER.with(|f| {
                let mut f = f.borrow_mut();
                let ours = f
                    .as_ref()
                    .zip(self.inner.root_fiber.get())
                    .map_or(false, |(a, b)| a == b);
                if ours {
                    *f = None;
                }
            });
        }
    }

    /// The dispatch loop. Executed by every worker thread, and by the
    /// caller thread's root fiber in caller mode.
    fn run(&self) {
        log::debug!("scheduler `{}` run", self.name());
        hook::set_enabled(true);
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(self.clone()));
        let tid = util::thread_id();
        if Some(tid) != self.inner.root_thread {
            // A plain worker schedules out of its main fiber.
            SCHEDULING_FIBER.with(|f| *f.borrow_mut() = Some(fiber::current()));
        }

        let idle = {
            let sched = self.clone();
            Fiber::new(move || sched.inner.hooks.idle(&sched))
                .expect("failed to allocate the idle fiber")
        };
        // Reused across callable tasks to avoid a stack allocation per task.
        let mut cb_fiber: Option<Fiber> = None;

        loop {
            let mut claimed: Option<Payload> = None;
            let mut tickle_me = false;
            {
                let mut st = self.lock();
                let mut i = 0;
                while i < st.tasks.len() {
                    if let Some(pin) = st.tasks[i].thread {
                        if pin != tid {
                            // Pinned elsewhere: leave it, wake the owner.
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    if let Payload::Fiber(f) = &st.tasks[i].payload {
                        let state = f.state();
                        assert!(
                            state != FiberState::Term,
                            "terminated fiber {} found in the task queue",
                            f.id(),
                        );
                        if state != FiberState::Ready {
                            // Re-submitted by a still-running fiber that
                            // has not completed its yield yet; claimable
                            // on a later scan.
                            i += 1;
                            continue;
                        }
                    }
                    let task = st.tasks.remove(i).expect("scan index in bounds");
                    claimed = Some(task.payload);
                    self.inner.active_threads.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                if claimed.is_some() && !st.tasks.is_empty() {
                    tickle_me = true;
                }
            }
            if tickle_me {
                self.tickle();
            }

            match claimed {
                Some(Payload::Fiber(f)) => {
                    f.resume();
                    self.inner.active_threads.fetch_sub(1, Ordering::Relaxed);
                }
                Some(Payload::Call(job)) => {
                    let f = if let Some(f) = cb_fiber.clone() {
                        // Reuse the slot: same stack, new callable.
                        f.reset_job(job);
                        f
                    } else {
                        let f = Fiber::from_job(&FiberAttr::new(), true, job)
                            .expect("failed to allocate a task fiber");
                        cb_fiber = Some(f.clone());
                        f
                    };
                    f.resume();
                    self.inner.active_threads.fetch_sub(1, Ordering::Relaxed);
                    if f.state() == FiberState::Ready {
                        // The callable yielded mid-run and owns its own
                        // continuation (it must have re-submitted its
                        // handle); this slot must not reset that stack.
                        cb_fiber = None;
                    }
                }
                None => {
                    if idle.state() == FiberState::Term {
                        // idle() only returns once stopping() holds, so
                        // this is the shutdown signal.
                        log::debug!("scheduler `{}` idle fiber terminated", self.name());
                        break;
                    }
                    self.inner.idle_threads.fetch_add(1, Ordering::Relaxed);
                    idle.resume();
                    self.inner.idle_threads.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        log::debug!("scheduler `{}` run exit", self.name());
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .field(
                "threads",
                &(self.inner.thread_count + self.inner.use_caller as usize),
            )
            .field("use_caller", &self.inner.use_caller)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn task_pinning() {
        let task = Task::call(|| {});
        assert!(task.thread.is_none());
        let task = task.on_thread(7);
        assert_eq!(task.thread, Some(7));
    }

    #[test]
    fn hooks_observe_tickles() {
        struct CountingHooks {
            tickles: Arc<AtomicUsize>,
        }
        impl Hooks for CountingHooks {
            fn tickle(&self, _sched: &Scheduler) {
                self.tickles.fetch_add(1, Ordering::Relaxed);
            }
        }

        let tickles = Arc::new(AtomicUsize::new(0));
        let sched = Scheduler::with_hooks(
            1,
            false,
            "hooked",
            CountingHooks {
                tickles: tickles.clone(),
            },
        );
        sched.start().unwrap();
        sched.schedule(Task::call(|| {})).unwrap();
        sched.stop();
        // At least the push into the empty queue and the one per pool
        // thread issued by stop().
        assert!(tickles.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn stopping_accessors() {
        let sched = Scheduler::new(1, false, "acc");
        assert!(!sched.stop_requested());
        assert_eq!(sched.pending_tasks(), 0);
        assert_eq!(sched.active_threads(), 0);
        sched.start().unwrap();
        sched.stop();
        assert!(sched.stop_requested());
        assert!(sched.stopping());
        assert_eq!(sched.idle_threads(), 0);
    }

    #[test]
    fn caller_mode_sets_and_clears_the_anchors() {
        let sched = Scheduler::new(1, true, "anchored");
        assert!(Scheduler::current().is_some());
        assert!(Scheduler::scheduling_fiber().is_some());
        sched.start().unwrap();
        sched.stop();
        assert!(Scheduler::current().is_none());
        assert!(Scheduler::scheduling_fiber().is_none());
    }
}
