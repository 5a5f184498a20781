use std::{
    cell::RefCell,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ambit::{ContextRegistry, LocalSlot, SnapshotFactory};

use crate::{Executor, Propagating, ScheduledExecutor, WorkerPool};

thread_local! {
    static OBS: RefCell<Option<Arc<String>>> = const { RefCell::new(None) };
}

fn set_obs(value: &str) {
    OBS.with_borrow_mut(|s| *s = Some(Arc::new(value.to_owned())));
}
fn read_obs() -> Option<String> {
    OBS.with_borrow(|s| s.as_ref().map(|v| v.to_string()))
}

fn registry() -> ContextRegistry {
    let registry = ContextRegistry::new();
    registry.register_thread_local(Arc::new(LocalSlot::new("obs", &OBS)));
    registry
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn propagates_to_worker_thread() {
    set_obs("hello");
    let pool = Propagating::with_factory(WorkerPool::new(1), SnapshotFactory::new(registry()));
    let (tx, rx) = flume::unbounded();

    let probe = tx.clone();
    pool.execute(Box::new(move || probe.send(read_obs()).unwrap()));
    // same worker thread, the first task's scope must have closed
    let probe = tx.clone();
    pool.execute(Box::new(move || probe.send(read_obs()).unwrap()));

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some("hello".to_owned()));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), None);

    // the submitting thread is unaffected
    assert_eq!(read_obs(), Some("hello".to_owned()));
    pool.join();
}

#[test]
fn captures_at_submission_time() {
    set_obs("s1");
    let pool = Propagating::with_factory(WorkerPool::new(1), SnapshotFactory::new(registry()));
    let (tx, rx) = flume::unbounded();

    pool.execute(Box::new(move || tx.send(read_obs()).unwrap()));
    set_obs("s2");

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some("s1".to_owned()));
    pool.join();
}

#[test]
fn bulk_submission_captures_once() {
    set_obs("bulk");
    let captures = Arc::new(AtomicUsize::new(0));
    let factory = SnapshotFactory::new(registry());
    let pool = {
        let captures = captures.clone();
        Propagating::new(WorkerPool::new(2), move || {
            captures.fetch_add(1, Ordering::SeqCst);
            factory.capture()
        })
    };
    let (tx, rx) = flume::unbounded();

    let tasks = (0..3)
        .map(|_| {
            let tx = tx.clone();
            Box::new(move || tx.send(read_obs()).unwrap()) as crate::Task
        })
        .collect();
    pool.execute_all(tasks);

    for _ in 0..3 {
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some("bulk".to_owned()));
    }
    assert_eq!(captures.load(Ordering::SeqCst), 1);
    pool.join();
}

#[test]
fn schedule_captures_at_submission_time() {
    set_obs("x");
    let pool = Propagating::with_factory(WorkerPool::new(1), SnapshotFactory::new(registry()));
    let (tx, rx) = flume::unbounded();

    pool.schedule(Duration::from_millis(50), Box::new(move || tx.send(read_obs()).unwrap()));
    set_obs("y");

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some("x".to_owned()));
    pool.join();
}

#[test]
fn scheduled_tasks_run_in_deadline_order() {
    let pool = WorkerPool::new(1);
    let (tx, rx) = flume::unbounded();

    let late = tx.clone();
    pool.schedule(Duration::from_millis(120), Box::new(move || late.send("late").unwrap()));
    let early = tx.clone();
    pool.schedule(Duration::from_millis(30), Box::new(move || early.send("early").unwrap()));

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "early");
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "late");
    pool.join();
}

#[test]
fn panic_in_task_is_contained() {
    set_obs("p");
    let pool = Propagating::with_factory(WorkerPool::new(1), SnapshotFactory::new(registry()));

    pool.execute(Box::new(|| panic!("boom")));

    // the worker survived and its slot was restored during the unwind
    let (tx, rx) = flume::unbounded();
    pool.delegate().execute(Box::new(move || tx.send(read_obs()).unwrap()));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), None);
    pool.join();
}

#[test]
fn join_runs_queued_tasks() {
    let pool = WorkerPool::new(2);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..16 {
        let counter = counter.clone();
        pool.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    pool.join();
    assert_eq!(counter.load(Ordering::SeqCst), 16);

    // submissions after shutdown are dropped, not errors
    pool.execute(Box::new(|| unreachable!("pool is shut down")));
}

#[cfg(feature = "rayon")]
#[test]
fn rayon_pool_propagates() {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    let pool = Propagating::with_factory(pool, SnapshotFactory::new(registry()));

    set_obs("r");
    let (tx, rx) = flume::unbounded();
    pool.execute(Box::new(move || tx.send(read_obs()).unwrap()));

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some("r".to_owned()));
}
