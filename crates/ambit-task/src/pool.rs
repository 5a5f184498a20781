use std::{
    cmp,
    collections::BinaryHeap,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{Executor, ScheduledExecutor, Task};

/// Small fixed worker pool with delayed scheduling.
///
/// Workers pull tasks from a shared queue, a panic in a task is contained and
/// the worker keeps running. Delayed tasks wait in a timer thread and enter
/// the queue when due. After [`shutdown`] already queued tasks still run,
/// tasks still waiting on the timer are dropped.
///
/// The pool shuts down on drop, without waiting, call [`join`] to wait.
///
/// [`shutdown`]: Executor::shutdown
/// [`join`]: Executor::join
pub struct WorkerPool {
    queue: Mutex<Option<flume::Sender<Task>>>,
    timer: Mutex<Option<flume::Sender<Delayed>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    seq: AtomicU64,
}

struct Delayed {
    at: Instant,
    seq: u64,
    task: Task,
}
impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // reversed, the earliest deadline sits on top of the max-heap
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

impl WorkerPool {
    /// New pool with `workers` threads plus one timer thread.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "worker pool needs at least one worker");

        let (queue_tx, queue_rx) = flume::unbounded::<Task>();
        let mut handles = Vec::with_capacity(workers + 1);
        for i in 0..workers {
            let rx = queue_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("ambit-worker-{i}"))
                .spawn(move || {
                    for task in rx.iter() {
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
                            tracing::error!("panic in worker task");
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        let (timer_tx, timer_rx) = flume::unbounded::<Delayed>();
        let timer_queue = queue_tx.clone();
        let handle = thread::Builder::new()
            .name("ambit-timer".to_owned())
            .spawn(move || timer_loop(timer_rx, timer_queue))
            .expect("failed to spawn timer thread");
        handles.push(handle);

        Self {
            queue: Mutex::new(Some(queue_tx)),
            timer: Mutex::new(Some(timer_tx)),
            handles: Mutex::new(handles),
            seq: AtomicU64::new(0),
        }
    }
}
impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        match self.queue.lock().as_ref() {
            Some(queue) => {
                if queue.send(task).is_err() {
                    tracing::error!("worker pool queue disconnected");
                }
            }
            None => tracing::warn!("task submitted after worker pool shutdown, dropped"),
        }
    }

    fn shutdown(&self) {
        // closing the channels ends the threads once the queue drains
        self.timer.lock().take();
        self.queue.lock().take();
    }

    fn join(&self) {
        self.shutdown();
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}
impl ScheduledExecutor for WorkerPool {
    fn schedule(&self, delay: Duration, task: Task) {
        let delayed = Delayed {
            at: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task,
        };
        match self.timer.lock().as_ref() {
            Some(timer) => {
                if timer.send(delayed).is_err() {
                    tracing::error!("worker pool timer disconnected");
                }
            }
            None => tracing::warn!("task scheduled after worker pool shutdown, dropped"),
        }
    }
}
impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("<workers>", &self.handles.lock().len()).finish()
    }
}

fn timer_loop(rx: flume::Receiver<Delayed>, queue: flume::Sender<Task>) {
    let mut pending = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while pending.peek().is_some_and(|d: &Delayed| d.at <= now) {
            if let Some(due) = pending.pop() {
                if queue.send(due.task).is_err() {
                    return;
                }
            }
        }

        let received = match pending.peek().map(|d| d.at) {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(delayed) => Some(delayed),
                Err(flume::RecvTimeoutError::Timeout) => None,
                Err(flume::RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(delayed) => Some(delayed),
                Err(flume::RecvError::Disconnected) => return,
            },
        };
        if let Some(delayed) = received {
            pending.push(delayed);
        }
    }
}
