use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::error::{CancelReason, RepairError};
use crate::fixtures::{self, CountingTransport};
use crate::models::{PartitionId, ReplicaId};
use crate::repair::{compute_repair, RepairCoordinator, RepairLogEntry, RepairResponse};
use crate::site::MemorySite;
use crate::store::{paths, CoordinationStore, NodeMode, Precondition, Store};
use crate::term::Term;
use crate::transport::LoopbackTransport;

fn entry(txn_id: u64) -> RepairLogEntry {
    RepairLogEntry {
        txn_id,
        payload: txn_id.to_be_bytes().to_vec(),
    }
}

async fn register(store: &Store, partition: PartitionId, replica: ReplicaId) -> Result<()> {
    store
        .put(&paths::participant(partition, replica), vec![], Precondition::Any, NodeMode::Ephemeral)
        .await?;
    Ok(())
}

#[test]
fn compute_repair_finds_cut_and_missing_entries() {
    let (a, b, c) = (ReplicaId::new(0, 1), ReplicaId::new(1, 1), ReplicaId::new(2, 1));
    let responses = vec![
        RepairResponse { replica: a, highest_durable: 1040, in_flight: vec![entry(1041), entry(1042)] },
        RepairResponse { replica: b, highest_durable: 1040, in_flight: vec![entry(1041)] },
        RepairResponse { replica: c, highest_durable: 1042, in_flight: vec![] },
    ];

    let plan = compute_repair(&responses);

    assert!(plan.highest_safe_txn == 1042, "unexpected cut, got {}, expected {}", plan.highest_safe_txn, 1042);
    assert_eq!(plan.missing.get(&b), Some(&vec![entry(1042)]), "unexpected entries missing from replica b");
    assert!(!plan.missing.contains_key(&a), "replica a holds every entry, got {:?}", plan.missing.get(&a));
    assert!(!plan.missing.contains_key(&c), "replica c is durable past every entry, got {:?}", plan.missing.get(&c));
}

#[test]
fn compute_repair_uses_durable_point_when_nothing_in_flight() {
    let responses = vec![
        RepairResponse { replica: ReplicaId::new(0, 1), highest_durable: 7, in_flight: vec![] },
        RepairResponse { replica: ReplicaId::new(1, 1), highest_durable: 9, in_flight: vec![] },
    ];
    let plan = compute_repair(&responses);
    assert!(plan.highest_safe_txn == 9, "unexpected cut, got {}, expected {}", plan.highest_safe_txn, 9);
    assert!(plan.missing.is_empty(), "expected nothing to repair, got {:?}", plan.missing);
}

#[tokio::test]
async fn repair_returns_cut_and_repairs_replicas() -> Result<()> {
    let (store, _config, _tmpdir) = fixtures::setup_store().await?;
    let store: Store = Arc::new(store);
    let (partition, b, c) = (PartitionId(3), ReplicaId::new(1, 1), ReplicaId::new(2, 1));
    let (site_b, site_c) = (Arc::new(MemorySite::new(partition, b)), Arc::new(MemorySite::new(partition, c)));
    for site in [&site_b, &site_c] {
        site.log_transaction(1041, vec![]);
        site.commit_through(1040);
    }
    site_b.log_transaction(1042, vec![]);
    let transport = LoopbackTransport::new();
    transport.register(partition, b, site_b.clone());
    transport.register(partition, c, site_c.clone());
    register(&store, partition, b).await?;
    register(&store, partition, c).await?;

    let term = Term::start(store.clone(), partition, b, "test").await?;
    let coordinator = RepairCoordinator::new(Arc::new(transport), partition, "test".into(), Duration::from_secs(2));
    let result = coordinator.run(&term, futures::future::pending()).await?;

    assert!(result.highest_safe_txn == 1042, "unexpected cut, got {}, expected {}", result.highest_safe_txn, 1042);
    assert_eq!(site_c.in_flight_txns(), vec![1041, 1042], "expected replica c to be repaired");

    Ok(())
}

#[tokio::test]
async fn repair_times_out_into_cancellation() -> Result<()> {
    let (store, _config, _tmpdir) = fixtures::setup_store().await?;
    let store: Store = Arc::new(store);
    let (partition, b) = (PartitionId(3), ReplicaId::new(1, 1));
    let loopback = LoopbackTransport::new();
    loopback.register(partition, b, Arc::new(MemorySite::new(partition, b)));
    let (transport, gate) = CountingTransport::new(loopback);
    gate.send_replace(false);
    register(&store, partition, b).await?;

    let term = Term::start(store.clone(), partition, b, "test").await?;
    let coordinator = RepairCoordinator::new(Arc::new(transport), partition, "test".into(), Duration::from_millis(100));
    let res = coordinator.run(&term, futures::future::pending()).await;

    assert!(
        matches!(res, Err(RepairError::Cancelled(CancelReason::Timeout(replica))) if replica == b),
        "expected a timeout cancellation, got {:?}",
        res
    );

    Ok(())
}

#[tokio::test]
async fn repair_cancelled_when_replica_set_changes() -> Result<()> {
    let (store, _config, _tmpdir) = fixtures::setup_store().await?;
    let store: Store = Arc::new(store);
    let (partition, b, c) = (PartitionId(3), ReplicaId::new(1, 1), ReplicaId::new(2, 1));
    let loopback = LoopbackTransport::new();
    loopback.register(partition, b, Arc::new(MemorySite::new(partition, b)));
    let (transport, gate) = CountingTransport::new(loopback);
    gate.send_replace(false);
    register(&store, partition, b).await?;

    let term = Term::start(store.clone(), partition, b, "test").await?;
    let coordinator = RepairCoordinator::new(Arc::new(transport), partition, "test".into(), Duration::from_secs(30));
    let (res, _) = tokio::join!(coordinator.run(&term, futures::future::pending()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        register(&store, partition, c).await
    });

    assert!(
        matches!(res, Err(RepairError::Cancelled(CancelReason::ReplicaSetChanged))),
        "expected a replica set cancellation, got {:?}",
        res
    );
    assert!(term.interesting_replicas().contains(&c), "expected term to observe the new replica");

    Ok(())
}

#[tokio::test]
async fn repair_cancelled_by_caller() -> Result<()> {
    let (store, _config, _tmpdir) = fixtures::setup_store().await?;
    let store: Store = Arc::new(store);
    let (partition, b) = (PartitionId(3), ReplicaId::new(1, 1));
    let loopback = LoopbackTransport::new();
    loopback.register(partition, b, Arc::new(MemorySite::new(partition, b)));
    let (transport, gate) = CountingTransport::new(loopback);
    gate.send_replace(false);
    register(&store, partition, b).await?;

    let term = Term::start(store.clone(), partition, b, "test").await?;
    let coordinator = RepairCoordinator::new(Arc::new(transport), partition, "test".into(), Duration::from_secs(30));
    let res = coordinator
        .run(&term, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            CancelReason::Superseded
        })
        .await;

    assert!(
        matches!(res, Err(RepairError::Cancelled(CancelReason::Superseded))),
        "expected a caller cancellation, got {:?}",
        res
    );

    Ok(())
}

#[tokio::test]
async fn repair_cancelled_when_replica_unreachable() -> Result<()> {
    let (store, _config, _tmpdir) = fixtures::setup_store().await?;
    let store: Store = Arc::new(store);
    let (partition, b, c) = (PartitionId(3), ReplicaId::new(1, 1), ReplicaId::new(2, 1));
    let transport = LoopbackTransport::new();
    transport.register(partition, b, Arc::new(MemorySite::new(partition, b)));
    register(&store, partition, b).await?;
    register(&store, partition, c).await?;

    let term = Term::start(store.clone(), partition, b, "test").await?;
    let coordinator = RepairCoordinator::new(Arc::new(transport), partition, "test".into(), Duration::from_secs(2));
    let res = coordinator.run(&term, futures::future::pending()).await;

    assert!(
        matches!(res, Err(RepairError::Cancelled(CancelReason::Unreachable(replica))) if replica == c),
        "expected an unreachable cancellation, got {:?}",
        res
    );

    Ok(())
}

#[tokio::test]
async fn repair_fails_without_live_replicas() -> Result<()> {
    let (store, _config, _tmpdir) = fixtures::setup_store().await?;
    let store: Store = Arc::new(store);
    let partition = PartitionId(3);

    let term = Term::start(store, partition, ReplicaId::new(1, 1), "test").await?;
    let coordinator = RepairCoordinator::new(Arc::new(LoopbackTransport::new()), partition, "test".into(), Duration::from_secs(2));
    let res = coordinator.run(&term, futures::future::pending()).await;

    assert!(matches!(res, Err(RepairError::Failed(_))), "expected the repair to fail, got {:?}", res);

    Ok(())
}
