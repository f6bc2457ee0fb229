//! End-to-end scheduler scenarios: caller mode, multi-worker dispatch,
//! affinity, self-re-submitting fibers and shutdown behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use strand::fiber::{self, Fiber, FiberState};
use strand::scheduler::{Scheduler, Task};

/// Polls `cond` until it holds, panicking after a generous timeout.
fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn caller_mode_runs_tasks_in_submission_order() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let sched = Scheduler::new(1, true, "s1");
    sched.start().unwrap();
    for label in ["A", "B", "C"] {
        let order = order.clone();
        sched
            .schedule(Task::call(move || order.lock().unwrap().push(label)))
            .unwrap();
    }

    // The caller is the only pool thread and it only dispatches inside
    // stop(), so nothing has run yet.
    assert_eq!(sched.pending_tasks(), 3);

    sched.stop();
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    assert_eq!(sched.pending_tasks(), 0);
    assert_eq!(sched.active_threads(), 0);
}

#[test]
fn multi_worker_dispatch_completes_all_tasks() {
    let counter = Arc::new(AtomicUsize::new(0));

    let sched = Scheduler::new(4, false, "s2");
    sched.start().unwrap();
    for _ in 0..1000 {
        let counter = counter.clone();
        sched
            .schedule(Task::call(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                // Hand the worker back once mid-task; the fiber finishes
                // when its re-submitted handle is claimed again. The
                // re-submission may lose the race against stop(), in
                // which case the count above has already happened.
                if let Some(sched) = Scheduler::current() {
                    let _ = sched.schedule(Task::fiber(fiber::current()));
                }
                fiber::yield_now();
            }))
            .unwrap();
    }

    wait_until("all tasks to run", || {
        counter.load(Ordering::Relaxed) == 1000
    });
    sched.stop();

    assert_eq!(counter.load(Ordering::Relaxed), 1000);
    assert_eq!(sched.pending_tasks(), 0);
    assert_eq!(sched.active_threads(), 0);
}

#[test]
fn pinned_tasks_run_on_their_thread() {
    let sched = Scheduler::new(3, false, "s3");
    sched.start().unwrap();

    let ids = sched.thread_ids();
    assert_eq!(ids.len(), 3);
    let target = ids[0];

    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..50 {
        let seen = seen.clone();
        sched
            .schedule(
                Task::call(move || seen.lock().unwrap().push(strand::util::thread_id()))
                    .on_thread(target),
            )
            .unwrap();
    }

    wait_until("pinned tasks to run", || seen.lock().unwrap().len() == 50);
    sched.stop();

    let seen = seen.lock().unwrap();
    assert!(
        seen.iter().all(|&id| id == target),
        "pinned task ran on a foreign thread: {seen:?}, target {target}",
    );
}

#[test]
fn fiber_resubmits_itself_across_yields() {
    let steps = Arc::new(AtomicUsize::new(0));

    let sched = Scheduler::new(1, false, "s5");
    sched.start().unwrap();

    let fib = {
        let steps = steps.clone();
        Fiber::new(move || {
            for _ in 0..5 {
                steps.fetch_add(1, Ordering::Relaxed);
                let sched = Scheduler::current().expect("running under a scheduler");
                sched.schedule(Task::fiber(fiber::current())).unwrap();
                fiber::yield_now();
            }
            steps.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap()
    };
    sched.schedule(Task::fiber(fib.clone())).unwrap();

    wait_until("the fiber to finish", || fib.state() == FiberState::Term);
    sched.stop();

    assert_eq!(steps.load(Ordering::Relaxed), 6);
    assert_eq!(fib.state(), FiberState::Term);
}

#[test]
fn stop_returns_promptly_when_idle() {
    let sched = Scheduler::new(2, false, "s6");
    sched.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let begin = Instant::now();
    sched.stop();
    assert!(
        begin.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        begin.elapsed(),
    );
    assert_eq!(sched.pending_tasks(), 0);
    assert_eq!(sched.active_threads(), 0);
}

#[test]
fn stop_is_idempotent() {
    let sched = Scheduler::new(2, false, "stop_twice");
    sched.start().unwrap();
    sched.stop();
    sched.stop();
    assert_eq!(sched.active_threads(), 0);
}

#[test]
fn schedule_after_stop_is_rejected() {
    let sched = Scheduler::new(1, false, "late");
    sched.start().unwrap();
    sched.stop();

    let res = sched.schedule(Task::call(|| {}));
    assert!(matches!(res, Err(strand::error::Error::Stopped { .. })));
}

#[test]
fn schedule_batch_preserves_submission_order() {
    let order = Arc::new(Mutex::new(Vec::new()));

    // One worker makes the claimable order global FIFO.
    let sched = Scheduler::new(1, false, "batch");
    sched.start().unwrap();

    let tasks: Vec<Task> = (0..10)
        .map(|i| {
            let order = order.clone();
            Task::call(move || order.lock().unwrap().push(i))
        })
        .collect();
    sched.schedule_batch(tasks).unwrap();

    wait_until("the batch to run", || order.lock().unwrap().len() == 10);
    sched.stop();

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn tasks_see_the_scheduler_through_the_anchor() {
    let name = Arc::new(Mutex::new(String::new()));

    let sched = Scheduler::new(2, false, "anchor");
    sched.start().unwrap();
    {
        let name = name.clone();
        sched
            .schedule(Task::call(move || {
                let sched = Scheduler::current().expect("anchor set on workers");
                *name.lock().unwrap() = sched.name().to_string();
            }))
            .unwrap();
    }

    wait_until("the task to run", || !name.lock().unwrap().is_empty());
    sched.stop();
    assert_eq!(*name.lock().unwrap(), "anchor");
}
