//! Keyed task distribution: a fixed set of workers where tasks sharing a
//! key run on the same worker, so same-key work serializes while distinct
//! keys proceed in parallel.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskDistribution {
    senders: Vec<mpsc::UnboundedSender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskDistribution {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let mut senders = Vec::with_capacity(concurrency);
        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
            senders.push(tx);
            workers.push(tokio::spawn(async move {
                while let Some(task) = rx.recv().await {
                    task();
                }
            }));
        }
        Self { senders, workers }
    }

    pub fn concurrency(&self) -> usize {
        self.senders.len()
    }

    /// Enqueue `task` on the worker owning `key`. The returned receiver
    /// resolves once the task has run.
    pub fn run<F>(&self, key: usize, task: F) -> oneshot::Receiver<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let idx = key % self.senders.len();
        let wrapped: Task = Box::new(move || {
            task();
            let _ = done_tx.send(());
        });
        if self.senders[idx].send(wrapped).is_err() {
            tracing::warn!(worker = idx, "task distribution worker is gone");
        }
        done_rx
    }

    /// Stop accepting tasks and wait for queued ones to finish.
    pub async fn close(mut self) {
        self.senders.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn same_key_serializes_in_order() {
        let pool = TaskDistribution::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut dones = Vec::new();
        for i in 0..16u32 {
            let seen = Arc::clone(&seen);
            dones.push(pool.run(3, move || {
                seen.lock().unwrap().push(i);
            }));
        }
        for done in dones {
            done.await.unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
        pool.close().await;
    }

    #[tokio::test]
    async fn distinct_keys_use_distinct_workers() {
        let pool = TaskDistribution::new(2);
        let done_a = pool.run(0, || {});
        let done_b = pool.run(1, || {});
        done_a.await.unwrap();
        done_b.await.unwrap();
        pool.close().await;
    }
}
