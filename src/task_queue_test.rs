use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::fixtures;
use crate::models::{PartitionId, ReplicaId};
use crate::site::MemorySite;
use crate::task_queue::{spawn_tick_producer, TaskQueue};

#[tokio::test]
async fn tasks_run_in_submission_order() -> Result<()> {
    let (queue, worker) = TaskQueue::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = worker.spawn(shutdown_tx.subscribe());
    let seen = Arc::new(Mutex::new(vec![]));

    for idx in 0..100 {
        let seen = seen.clone();
        assert!(queue.offer(move || seen.lock().unwrap().push(idx)), "expected offer to succeed");
    }
    let last = queue.submit(|| 100).await?;

    assert!(last == 100, "unexpected submit output, got {}, expected {}", last, 100);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..100).collect::<Vec<_>>(), "expected tasks to run in FIFO order");

    let _ = shutdown_tx.send(());
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_queued_tasks() -> Result<()> {
    let (queue, worker) = TaskQueue::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_rx = shutdown_tx.subscribe();
    let seen = Arc::new(Mutex::new(vec![]));

    // Everything is queued & shutdown signalled before the worker ever runs.
    for idx in 0..10 {
        let seen = seen.clone();
        queue.offer(move || seen.lock().unwrap().push(idx));
    }
    let _ = shutdown_tx.send(());
    worker.spawn(shutdown_rx).await?;

    assert!(seen.lock().unwrap().len() == 10, "expected every queued task to run, got {:?}", seen.lock().unwrap());
    assert!(!queue.offer(|| ()), "expected offer to fail once the worker has stopped");
    let res = queue.submit(|| ()).await;
    assert!(res.is_err(), "expected submit to fail once the worker has stopped");
    Ok(())
}

#[tokio::test]
async fn tick_producer_ticks_site_through_queue() -> Result<()> {
    let (queue, worker) = TaskQueue::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let worker_handle = worker.spawn(shutdown_tx.subscribe());
    let site = Arc::new(MemorySite::new(PartitionId(0), ReplicaId::new(0, 1)));
    let ticks = spawn_tick_producer(queue, site.clone(), Duration::from_millis(10), shutdown_tx.subscribe());

    fixtures::wait_for("site ticks", || site.ticks() >= 3).await?;

    let _ = shutdown_tx.send(());
    ticks.await?;
    worker_handle.await?;
    Ok(())
}
