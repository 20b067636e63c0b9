//! Event loop invariants: exactly-once dispatch on the owning thread,
//! per-submitter FIFO order, timers, cancellation, and group lifecycle.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use loomio::{ErrorCode, EventLoopGroup, EventLoopGroupOptions, Task, TaskStatus};

fn group_of(count: usize) -> Arc<EventLoopGroup> {
    common::init_test();
    Arc::new(
        EventLoopGroup::new(EventLoopGroupOptions {
            loop_count: count,
            clock: None,
        })
        .unwrap(),
    )
}

fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    pred()
}

#[test]
fn tasks_dispatch_exactly_once_on_the_loop_thread() {
    let group = group_of(1);
    let event_loop = group.next_loop().clone();

    let hits = Arc::new(AtomicUsize::new(0));
    let threads: Arc<Mutex<Vec<thread::ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..32 {
        let hits = hits.clone();
        let threads = threads.clone();
        event_loop
            .schedule_task_now(Task::new("count", move |_, status| {
                assert_eq!(status, TaskStatus::RunReady);
                hits.fetch_add(1, Ordering::SeqCst);
                threads.lock().unwrap().push(thread::current().id());
            }))
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 32
    }));
    let threads = threads.lock().unwrap();
    assert!(threads.windows(2).all(|w| w[0] == w[1]), "single loop thread");
}

#[test]
fn single_submitter_tasks_run_in_fifo_order() {
    let group = group_of(1);
    let event_loop = group.next_loop().clone();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100usize {
        let order = order.clone();
        event_loop
            .schedule_task_now(Task::new("fifo", move |_, _| {
                order.lock().unwrap().push(i);
            }))
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || {
        order.lock().unwrap().len() == 100
    }));
    let order = order.lock().unwrap();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "submission order kept");
}

#[test]
fn future_task_fires_after_its_deadline() {
    let group = group_of(1);
    let event_loop = group.next_loop().clone();

    let fired_at = Arc::new(Mutex::new(None));
    let start = Instant::now();
    let run_at = event_loop.now_ns() + Duration::from_millis(50).as_nanos() as u64;

    let f = fired_at.clone();
    event_loop
        .schedule_task_future(
            Task::new("timer", move |_, _| {
                *f.lock().unwrap() = Some(Instant::now());
            }),
            run_at,
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        fired_at.lock().unwrap().is_some()
    }));
    let elapsed = fired_at.lock().unwrap().unwrap() - start;
    assert!(elapsed >= Duration::from_millis(45), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "fired late: {elapsed:?}");
}

#[test]
fn pending_tasks_are_canceled_at_shutdown() {
    let group = group_of(1);
    let event_loop = group.next_loop().clone();

    let status_seen = Arc::new(Mutex::new(None));
    let s = status_seen.clone();
    let far = event_loop.now_ns() + Duration::from_secs(3600).as_nanos() as u64;
    event_loop
        .schedule_task_future(
            Task::new("far_future", move |_, status| {
                *s.lock().unwrap() = Some(status);
            }),
            far,
        )
        .unwrap();

    group.shutdown();
    assert_eq!(*status_seen.lock().unwrap(), Some(TaskStatus::Canceled));
}

#[test]
fn submission_after_stop_is_rejected() {
    let group = group_of(1);
    let event_loop = group.next_loop().clone();
    group.shutdown();

    let err = event_loop
        .schedule_task_now(Task::new("late", |_, _| {}))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::EVENT_LOOP_SHUTDOWN);
}

#[test]
fn group_round_robins_across_loops() {
    let group = group_of(2);
    assert_eq!(group.loops().len(), 2);

    let ids = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let ids = ids.clone();
        group
            .next_loop()
            .schedule_task_now(Task::new("whoami", move |_, _| {
                ids.lock().unwrap().push(thread::current().id());
            }))
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || {
        ids.lock().unwrap().len() == 2
    }));
    let ids = ids.lock().unwrap();
    assert_ne!(ids[0], ids[1], "consecutive picks land on distinct loops");
}

#[test]
fn on_loop_thread_is_true_only_inside_tasks() {
    let group = group_of(1);
    let event_loop = group.next_loop().clone();
    assert!(!event_loop.on_loop_thread());

    let observed = Arc::new(Mutex::new(None));
    let o = observed.clone();
    let el = event_loop.clone();
    event_loop
        .schedule_task_now(Task::new("check_thread", move |ctx, _| {
            *o.lock().unwrap() = Some(ctx.event_loop().on_loop_thread() && el.on_loop_thread());
        }))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        observed.lock().unwrap().is_some()
    }));
    assert_eq!(*observed.lock().unwrap(), Some(true));
}
