//! Ambient context propagating executors.
//!
//! # Crate
//!
#![doc = include_str!(concat!("../", std::env!("CARGO_PKG_README")))]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]

use std::{fmt, sync::Arc, time::Duration};

use ambit::{Snapshot, SnapshotFactory};

mod pool;
pub use pool::WorkerPool;

#[cfg(test)]
mod tests;

/// A unit of work accepted by an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A delegate that runs tasks, a thread pool usually.
///
/// The contract is deliberately small, submission plus lifecycle. Implementors
/// run each task exactly once on some thread, submission order between tasks
/// is not part of the contract.
pub trait Executor: Send + Sync {
    /// Run `task` on some thread.
    fn execute(&self, task: Task);

    /// Run every task, submitted as one batch.
    fn execute_all(&self, tasks: Vec<Task>) {
        for task in tasks {
            self.execute(task);
        }
    }

    /// Stop accepting tasks, already accepted tasks still run.
    fn shutdown(&self) {}

    /// Wait until accepted tasks finish, shutting down first if still running.
    fn join(&self) {}
}

/// An [`Executor`] that can also run tasks after a delay.
pub trait ScheduledExecutor: Executor {
    /// Run `task` on some thread after `delay` elapses.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Delegating executor that binds the submitter's ambient state to every task.
///
/// On each submission the provider captures a fresh [`Snapshot`] from the
/// *submitting* thread, the task is wrapped with it and forwarded to the
/// delegate. Batch submissions capture once per call and share the snapshot
/// among the batch. Lifecycle operations forward verbatim.
pub struct Propagating<E> {
    delegate: E,
    provider: Arc<dyn Fn() -> Snapshot + Send + Sync>,
}
impl<E> Propagating<E> {
    /// New wrapper capturing through `provider` on every submission.
    pub fn new(delegate: E, provider: impl Fn() -> Snapshot + Send + Sync + 'static) -> Self {
        Self {
            delegate,
            provider: Arc::new(provider),
        }
    }

    /// New wrapper capturing through [`SnapshotFactory::capture`].
    pub fn with_factory(delegate: E, factory: SnapshotFactory) -> Self {
        Self::new(delegate, move || factory.capture())
    }

    /// The wrapped executor.
    pub fn delegate(&self) -> &E {
        &self.delegate
    }

    /// Unwrap the executor.
    pub fn into_delegate(self) -> E {
        self.delegate
    }
}
impl<E: Executor> Executor for Propagating<E> {
    fn execute(&self, task: Task) {
        let snapshot = (self.provider)();
        self.delegate.execute(Box::new(snapshot.wrap(task)));
    }

    fn execute_all(&self, tasks: Vec<Task>) {
        let snapshot = (self.provider)();
        let wrapped = tasks
            .into_iter()
            .map(|task| Box::new(snapshot.clone().wrap(task)) as Task)
            .collect();
        self.delegate.execute_all(wrapped);
    }

    fn shutdown(&self) {
        self.delegate.shutdown()
    }

    fn join(&self) {
        self.delegate.join()
    }
}
impl<E: ScheduledExecutor> ScheduledExecutor for Propagating<E> {
    fn schedule(&self, delay: Duration, task: Task) {
        let snapshot = (self.provider)();
        self.delegate.schedule(delay, Box::new(snapshot.wrap(task)));
    }
}
impl<E: fmt::Debug> fmt::Debug for Propagating<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Propagating").field("delegate", &self.delegate).finish_non_exhaustive()
    }
}

#[cfg(feature = "rayon")]
impl Executor for rayon::ThreadPool {
    fn execute(&self, task: Task) {
        self.spawn(task);
    }
}
