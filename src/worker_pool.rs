use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads pulling tasks from a shared queue.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(size);

        for i in 0..size.max(1) {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || Self::run_worker(receiver))
                .with_context(|| format!("Failed to spawn worker {}-{}", name, i))?;
            workers.push(handle);
        }

        log::debug!("Started {} {} workers", workers.len(), name);
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    fn run_worker(receiver: Receiver<Task>) {
        while let Ok(task) = receiver.recv() {
            // a panicking task drops its result sender; the worker survives
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("Worker task panicked");
            }
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` and returns a receiver for its result.
    pub fn submit<T, F>(&self, f: F) -> Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = channel::bounded(1);
        let task: Task = Box::new(move || {
            let _ = result_tx.send(f());
        });

        if let Some(sender) = &self.sender {
            if sender.send(task).is_err() {
                log::warn!("Worker pool is shut down, task dropped");
            }
        }
        result_rx
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        log::debug!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_submit_returns_result() {
        let pool = WorkerPool::new("test", 2).unwrap();
        assert_eq!(pool.size(), 2);

        let rx = pool.submit(|| 21 * 2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_panicking_task_disconnects_and_pool_survives() {
        let pool = WorkerPool::new("test", 1).unwrap();

        let rx = pool.submit(|| -> u32 { panic!("detector blew up") });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());

        let rx = pool.submit(|| 7u32);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
