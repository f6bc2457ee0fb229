//! Kept in its own test binary: it measures fiber construction through
//! the process-wide id counter and must not race other tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strand::scheduler::{Scheduler, Task};
use strand::Fiber;

#[test]
fn callable_tasks_reuse_the_worker_fiber_slot() {
    let sched = Scheduler::new(1, false, "s4");
    sched.start().unwrap();

    // Ids are handed out monotonically; two probes bracket everything
    // created in between.
    let before = Fiber::new(|| {}).unwrap().id();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let counter = counter.clone();
        sched
            .schedule(Task::call(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::Relaxed) != 100 {
        assert!(Instant::now() < deadline, "tasks did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }
    sched.stop();

    let after = Fiber::new(|| {}).unwrap().id();
    // The 100 callables share one repeatedly reset fiber; besides it only
    // the pool's own bookkeeping fibers (worker main, idle) were created.
    let created = after - before - 1;
    assert!(created < 100, "expected slot reuse, created {created} fibers");
    assert_eq!(counter.load(Ordering::Relaxed), 100);
}
