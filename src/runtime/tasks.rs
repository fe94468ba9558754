//! Thread pool and task system
//!
//! `SpawnFunc` dispatches an independent VM run onto a fixed pool of
//! worker threads. Handles are assigned monotonically; `Await` consumes
//! the handle and blocks on the worker's result channel. A spawned
//! coroutine's error is carried through the channel and surfaces on
//! `Await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::bytecode::Value;
use crate::vm::errors::RuntimeError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool fed by an unbounded channel.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = unbounded::<Job>();

        let handles = (0..workers)
            .map(|_| {
                let receiver: Receiver<Job> = receiver.clone();
                thread::spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
            })
            .collect();

        Self {
            sender: Some(sender),
            workers: handles,
        }
    }

    pub fn execute(&self, job: Job) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain and exit.
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Number of workers the default runtime uses.
pub fn default_worker_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(2).max(2)
}

pub type TaskResult = Result<Value, RuntimeError>;

/// Handle table mapping spawned tasks to their result channels.
pub struct TaskSystem {
    pool: ThreadPool,
    next_id: AtomicI64,
    tasks: Mutex<HashMap<i64, Receiver<TaskResult>>>,
}

impl TaskSystem {
    pub fn new(workers: usize) -> Self {
        Self {
            pool: ThreadPool::new(workers),
            next_id: AtomicI64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a task and hand back its handle.
    pub fn spawn<F>(&self, task: F) -> i64
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        let (sender, receiver) = bounded(1);
        self.pool.execute(Box::new(move || {
            let _ = sender.send(task());
        }));
        let handle = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(handle, receiver);
        debug!(handle, "task spawned");
        handle
    }

    /// Block on a task's result. The handle is consumed: a second await
    /// of the same handle fails.
    pub fn await_handle(&self, handle: i64) -> TaskResult {
        let receiver = self
            .tasks
            .lock()
            .remove(&handle)
            .ok_or(RuntimeError::TaskHandleNotFound)?;
        receiver
            .recv()
            .map_err(|_| RuntimeError::host("Task worker exited without a result"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_await_round_trip() {
        let tasks = TaskSystem::new(2);
        let handle = tasks.spawn(|| Ok(Value::Int(41)));
        assert!(matches!(tasks.await_handle(handle), Ok(Value::Int(41))));
    }

    #[test]
    fn handles_are_consumed_by_await() {
        let tasks = TaskSystem::new(2);
        let handle = tasks.spawn(|| Ok(Value::Nil));
        let _ = tasks.await_handle(handle);
        assert!(matches!(
            tasks.await_handle(handle),
            Err(RuntimeError::TaskHandleNotFound)
        ));
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let tasks = TaskSystem::new(1);
        assert!(matches!(
            tasks.await_handle(404),
            Err(RuntimeError::TaskHandleNotFound)
        ));
    }

    #[test]
    fn task_errors_surface_on_await() {
        let tasks = TaskSystem::new(1);
        let handle = tasks.spawn(|| Err(RuntimeError::DivisionByZero));
        assert!(matches!(
            tasks.await_handle(handle),
            Err(RuntimeError::DivisionByZero)
        ));
    }

    #[test]
    fn tasks_run_in_parallel_workers() {
        let tasks = TaskSystem::new(4);
        let handles: Vec<i64> = (0..8)
            .map(|i| tasks.spawn(move || Ok(Value::Int(i * 10))))
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert!(matches!(
                tasks.await_handle(handle),
                Ok(Value::Int(v)) if v == (i as i64) * 10
            ));
        }
    }
}
