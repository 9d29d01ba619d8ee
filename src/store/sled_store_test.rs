use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::error::StoreError;
use crate::store::{CoordinationStore, NodeMode, Precondition, SledStore, StoreEvent};

#[tokio::test]
async fn put_increments_versions_and_checks_preconditions() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config).await?;

    let v1 = store.put("/leaders/3", b"a".to_vec(), Precondition::Absent, NodeMode::Persistent).await?;
    assert!(v1 == 1, "unexpected version after first write, got {}, expected {}", v1, 1);

    let res = store.put("/leaders/3", b"b".to_vec(), Precondition::Absent, NodeMode::Persistent).await;
    assert!(
        matches!(res, Err(StoreError::WriteConflict { actual: Some(1), .. })),
        "expected a write conflict when writing an existing node as absent, got {:?}",
        res
    );

    let v2 = store.put("/leaders/3", b"b".to_vec(), Precondition::Version(1), NodeMode::Persistent).await?;
    assert!(v2 == 2, "unexpected version after second write, got {}, expected {}", v2, 2);

    let res = store.put("/leaders/3", b"c".to_vec(), Precondition::Version(1), NodeMode::Persistent).await;
    assert!(
        matches!(res, Err(StoreError::WriteConflict { actual: Some(2), .. })),
        "expected a write conflict on a stale version, got {:?}",
        res
    );

    let node = store.get("/leaders/3").await?.context("expected node to exist")?;
    assert!(node.version == 2, "unexpected node version, got {}, expected {}", node.version, 2);
    assert_eq!(node.data, b"b".to_vec(), "unexpected node data");

    let v3 = store.put("/leaders/3", b"d".to_vec(), Precondition::Any, NodeMode::Persistent).await?;
    assert!(v3 == 3, "unexpected version after unconditional write, got {}, expected {}", v3, 3);

    Ok(())
}

#[tokio::test]
async fn list_returns_nodes_ordered_under_prefix_only() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config).await?;

    store.put("/leaders/2", b"2".to_vec(), Precondition::Any, NodeMode::Persistent).await?;
    store.put("/leaders/1", b"1".to_vec(), Precondition::Any, NodeMode::Persistent).await?;
    store.put("/leaders-canonical/1", b"x".to_vec(), Precondition::Any, NodeMode::Persistent).await?;

    let listed = store.list("/leaders/").await?;
    let paths: Vec<_> = listed.iter().map(|(path, _)| path.as_str()).collect();
    assert_eq!(paths, vec!["/leaders/1", "/leaders/2"], "unexpected listing of /leaders/");

    Ok(())
}

#[tokio::test]
async fn closing_a_session_removes_only_its_ephemeral_nodes() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config).await?;
    let other = store.new_session();

    store.put("/participants/3/1", vec![], Precondition::Any, NodeMode::Ephemeral).await?;
    store.put("/leaders/3", vec![], Precondition::Any, NodeMode::Persistent).await?;
    other.put("/participants/3/2", vec![], Precondition::Any, NodeMode::Ephemeral).await?;

    store.close().await?;
    store.close().await?; // Closing twice is a no-op.

    assert!(other.get("/participants/3/1").await?.is_none(), "expected ephemeral node of closed session to be removed");
    assert!(other.get("/participants/3/2").await?.is_some(), "expected ephemeral node of live session to remain");
    assert!(other.get("/leaders/3").await?.is_some(), "expected persistent node to remain");

    let res = store.get("/leaders/3").await;
    assert!(matches!(res, Err(StoreError::SessionClosed)), "expected closed session to be unusable, got {:?}", res);

    Ok(())
}

#[tokio::test]
async fn persistent_rewrite_releases_ephemeral_ownership() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config).await?;
    let other = store.new_session();

    store.put("/hosts/0", vec![], Precondition::Any, NodeMode::Ephemeral).await?;
    other.put("/hosts/0", vec![], Precondition::Any, NodeMode::Persistent).await?;
    store.close().await?;

    assert!(other.get("/hosts/0").await?.is_some(), "expected node rewritten as persistent to survive session close");

    Ok(())
}

#[tokio::test]
async fn watch_delivers_puts_and_deletes_under_prefix() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config).await?;
    let mut events = store.watch("/balance-indicator/")?;

    store.put("/balance-indicator/host-0", vec![], Precondition::Any, NodeMode::Ephemeral).await?;
    store.put("/leaders/0", vec![], Precondition::Any, NodeMode::Persistent).await?;
    store.delete("/balance-indicator/host-0").await?;

    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .context("timeout waiting for first watch event")?
        .context("watch channel closed unexpectedly")?;
    assert_eq!(
        first,
        StoreEvent::Put { path: "/balance-indicator/host-0".into(), version: 1 },
        "unexpected first watch event"
    );
    let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .context("timeout waiting for second watch event")?
        .context("watch channel closed unexpectedly")?;
    assert_eq!(second, StoreEvent::Deleted { path: "/balance-indicator/host-0".into() }, "unexpected second watch event");

    Ok(())
}

#[tokio::test]
async fn reopening_purges_ephemeral_nodes_of_previous_process() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    {
        let store = SledStore::new(config.clone()).await?;
        store.put("/hosts/0", vec![], Precondition::Any, NodeMode::Ephemeral).await?;
        store.put("/leaders/0", vec![], Precondition::Any, NodeMode::Persistent).await?;
        store.flush().await?;
    }

    let store = SledStore::new(config).await?;
    assert!(store.get("/hosts/0").await?.is_none(), "expected ephemeral node to be purged on reopen");
    assert!(store.get("/leaders/0").await?.is_some(), "expected persistent node to survive reopen");

    Ok(())
}
