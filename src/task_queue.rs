//! A single worker FIFO queue serializing mutations of a site.
//!
//! Role transitions, DR gateway installation and ticks are all applied to a site through its
//! queue, so the site never observes them concurrently with each other or out of order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::execution::ExecutionSite;

const METRIC_TASKS_EXECUTED: &str = "failover_task_queue_tasks_executed";

/// A task to be run against a site.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A handle used to enqueue tasks.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
    /// Create a new queue along with the worker which executes its tasks.
    pub fn new() -> (Self, TaskQueueWorker) {
        metrics::register_counter!(METRIC_TASKS_EXECUTED, metrics::Unit::Count, "tasks executed by site task queues");
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskQueueWorker { rx })
    }

    /// Enqueue the given task, returning false if the worker has already stopped.
    ///
    /// This never blocks.
    pub fn offer<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Enqueue the given task, returning its output once it has been executed.
    pub async fn submit<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let enqueued = self.offer(move || {
            let _ = tx.send(task());
        });
        if !enqueued {
            return Err(anyhow!("task queue worker has stopped"));
        }
        rx.await.map_err(|_| anyhow!("task dropped by task queue worker"))
    }
}

/// The single worker of a task queue.
pub struct TaskQueueWorker {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl TaskQueueWorker {
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Execute tasks in order until shutdown, then drain every task already queued.
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                task_opt = self.rx.recv() => match task_opt {
                    Some(task) => Self::execute(task),
                    None => return,
                },
                _ = shutdown.recv() => break,
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Some(task) = self.rx.recv().await {
            Self::execute(task);
            drained += 1;
        }
        tracing::debug!(drained, "task queue worker shutdown");
    }

    fn execute(task: Task) {
        task();
        metrics::increment_counter!(METRIC_TASKS_EXECUTED);
    }
}

/// Spawn a task which enqueues a tick of the given site at every interval.
pub fn spawn_tick_producer(
    queue: TaskQueue, site: Arc<dyn ExecutionSite>, interval: Duration, mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(interval));
        loop {
            tokio::select! {
                Some(_) = ticks.next() => {
                    let site = site.clone();
                    if !queue.offer(move || site.tick()) {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
