//! Scheduler end-to-end: task draining, yields, caller mode.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strand_runtime::{CoState, Coroutine, Scheduler, Task};

#[test]
fn n_tasks_k_workers_all_run_exactly_once() {
    let sched = Scheduler::new(4, false, "drain");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..500 {
        let h = hits.clone();
        sched.schedule(Task::call(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
    }

    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 500);
}

#[test]
fn scheduled_coroutines_end_term() {
    let sched = Scheduler::new(2, false, "coros");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    let mut coros = Vec::new();
    for _ in 0..32 {
        let h = hits.clone();
        let co = Coroutine::spawn(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        sched.schedule(co.clone());
        coros.push(co);
    }

    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 32);
    for co in coros {
        assert!(co.state().is_done(), "coroutine ended in {}", co.state());
    }
}

#[test]
fn yield_to_ready_resumes_and_completes() {
    let sched = Scheduler::new(1, false, "yield");
    sched.start();

    let steps = Arc::new(AtomicUsize::new(0));
    let s = steps.clone();
    let co = Coroutine::spawn(move || {
        s.fetch_add(1, Ordering::SeqCst);
        Coroutine::yield_to_ready();
        s.fetch_add(1, Ordering::SeqCst);
        Coroutine::yield_to_ready();
        s.fetch_add(1, Ordering::SeqCst);
    });
    sched.schedule(co.clone());

    sched.stop();
    assert_eq!(steps.load(Ordering::SeqCst), 3);
    assert!(co.state().is_done());
}

#[test]
fn panicking_task_does_not_poison_the_worker() {
    let sched = Scheduler::new(1, false, "except");
    sched.start();

    let co = Coroutine::spawn(|| {
        panic!("task exploded");
    });
    sched.schedule(co.clone());

    let after = Arc::new(AtomicUsize::new(0));
    let a = after.clone();
    sched.schedule(Task::call(move || {
        a.fetch_add(1, Ordering::SeqCst);
    }));

    sched.stop();
    assert_eq!(co.state(), CoState::Except);
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn caller_mode_chain_runs_before_stop_returns() {
    // use_caller with a single thread: everything runs inside stop().
    let sched = Scheduler::new(1, true, "caller");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));

    let h1 = hits.clone();
    let first = Coroutine::spawn(move || {
        h1.fetch_add(1, Ordering::SeqCst);
        let h2 = h1.clone();
        let second = Coroutine::spawn(move || {
            h2.fetch_add(1, Ordering::SeqCst);
            let h3 = h2.clone();
            let third = Coroutine::spawn(move || {
                h3.fetch_add(1, Ordering::SeqCst);
            });
            Scheduler::current().unwrap().schedule(third);
        });
        Scheduler::current().unwrap().schedule(second);
    });
    sched.schedule(first);

    assert_eq!(hits.load(Ordering::SeqCst), 0, "nothing may run before stop");
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn thread_affinity_hint_is_honored() {
    let sched = Scheduler::new(3, false, "affinity");
    sched.start();

    // Learn a worker's kernel thread id from inside a task.
    let (tx, rx) = std::sync::mpsc::channel();
    sched.schedule(Task::call(move || {
        // SAFETY: gettid has no failure modes.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as i64 };
        tx.send(tid).unwrap();
    }));
    let worker_tid = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    for _ in 0..16 {
        let tx = tx.clone();
        sched.schedule_with_thread(
            Task::call(move || {
                let tid = unsafe { libc::syscall(libc::SYS_gettid) as i64 };
                tx.send(tid).unwrap();
            }),
            worker_tid,
        );
    }
    drop(tx);
    let mut seen = 0;
    while let Ok(tid) = rx.recv_timeout(std::time::Duration::from_secs(5)) {
        assert_eq!(tid, worker_tid, "pinned task ran on the wrong worker");
        seen += 1;
    }
    assert_eq!(seen, 16);

    sched.stop();
}
