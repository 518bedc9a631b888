//! End-to-end scenarios against a 3-replica cluster.

mod common;

use common::TestCluster;

use paxkv::{KvsClient, PaxkvError, NO_LOCK};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_read_chain() -> Result<(), PaxkvError> {
    let cluster = TestCluster::start("write-read", 30500, 3, true).await;
    let mut client = KvsClient::new(vec![cluster.api_addrs.clone()]);

    assert!(client.put("row1", "col1", b"value1", NO_LOCK).await?);
    assert_eq!(
        client.get("row1", "col1", NO_LOCK).await?,
        Some(b"value1".to_vec())
    );

    assert!(client.put("row1", "col1", b"value2", NO_LOCK).await?);
    assert_eq!(
        client.get("row1", "col1", NO_LOCK).await?,
        Some(b"value2".to_vec())
    );

    assert!(client
        .cput("row1", "col1", b"value2", b"value3", NO_LOCK)
        .await?);
    assert_eq!(
        client.get("row1", "col1", NO_LOCK).await?,
        Some(b"value3".to_vec())
    );

    // reads and writes are linearized regardless of which replica serves:
    // a second client walking the same cluster sees the latest value
    let mut other = KvsClient::new(vec![vec![cluster.api_addrs[2]]]);
    assert_eq!(
        other.get("row1", "col1", NO_LOCK).await?,
        Some(b"value3".to_vec())
    );

    client.leave().await?;
    other.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cput_fencepost() -> Result<(), PaxkvError> {
    let cluster = TestCluster::start("cput", 30540, 3, true).await;
    let mut client = KvsClient::new(vec![cluster.api_addrs.clone()]);

    assert!(client.put("abc", "bcd", b"5", NO_LOCK).await?);
    assert!(client.cput("abc", "bcd", b"5", b"6", NO_LOCK).await?);
    assert_eq!(
        client.get("abc", "bcd", NO_LOCK).await?,
        Some(b"6".to_vec())
    );

    // stale expectation fails and leaves the value untouched
    assert!(!client.cput("abc", "bcd", b"5", b"7", NO_LOCK).await?);
    assert_eq!(
        client.get("abc", "bcd", NO_LOCK).await?,
        Some(b"6".to_vec())
    );

    client.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_protocol() -> Result<(), PaxkvError> {
    let cluster = TestCluster::start("locks", 30580, 3, true).await;
    let mut alice = KvsClient::new(vec![cluster.api_addrs.clone()]);
    let mut bob = KvsClient::new(vec![cluster.api_addrs.clone()]);

    assert!(alice.put("row1", "col1", b"value1", NO_LOCK).await?);

    let token = alice.set_nx("row1").await?.expect("lock denied");

    // without the token the row is inaccessible
    assert_eq!(bob.get("row1", "col1", NO_LOCK).await?, None);
    assert!(!bob.put("row1", "col1", b"intruder", NO_LOCK).await?);
    assert_eq!(bob.set_nx("row1").await?, None);

    // the holder operates freely under the token
    assert_eq!(
        alice.get("row1", "col1", &token).await?,
        Some(b"value1".to_vec())
    );

    // after release the row opens up again
    assert!(alice.del("row1", &token).await?);
    assert_eq!(
        bob.get("row1", "col1", NO_LOCK).await?,
        Some(b"value1".to_vec())
    );
    assert!(bob.set_nx("row1").await?.is_some());

    alice.leave().await?;
    bob.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn setnx_race_has_single_winner() -> Result<(), PaxkvError> {
    let cluster = TestCluster::start("race", 30620, 3, true).await;

    let mut tasks = Vec::new();
    for i in 0..3 {
        // each contender talks to a different replica first
        let mut addrs = cluster.api_addrs.clone();
        addrs.rotate_left(i);
        tasks.push(tokio::spawn(async move {
            let mut client = KvsClient::new(vec![addrs]);
            client.set_nx("racer").await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap()?.is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_failure_makes_progress() -> Result<(), PaxkvError> {
    let mut cluster = TestCluster::start("minority", 30860, 3, true).await;
    let mut client =
        KvsClient::new(vec![vec![cluster.api_addrs[0], cluster.api_addrs[1]]]);

    assert!(client.put("row1", "col1", b"before", NO_LOCK).await?);

    // with one of three replicas down, the remaining majority still
    // decides and serves
    cluster.kill_replica(2);
    assert!(client.put("row1", "col1", b"after", NO_LOCK).await?);
    assert_eq!(
        client.get("row1", "col1", NO_LOCK).await?,
        Some(b"after".to_vec())
    );

    client.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enumeration_across_cache_and_disk() -> Result<(), PaxkvError> {
    let cluster = TestCluster::start("enum", 30660, 3, true).await;
    let mut client = KvsClient::new(vec![cluster.api_addrs.clone()]);

    for (row, col) in [("r1", "c1"), ("r1", "c2"), ("r2", "c1")] {
        assert!(client.put(row, col, b"v", NO_LOCK).await?);
    }

    let mut rows = client.get_all_rows().await?;
    rows.sort();
    rows.dedup();
    assert_eq!(rows, vec!["r1".to_string(), "r2".to_string()]);

    let mut cols = client.get_cols_in_row("r1", NO_LOCK).await?;
    cols.sort();
    cols.dedup();
    assert_eq!(cols, vec!["c1".to_string(), "c2".to_string()]);

    // the local (no-consensus) variants answer from one replica alone
    let mut local_rows = client.get_all_rows_on(cluster.api_addrs[0]).await?;
    local_rows.sort();
    local_rows.dedup();
    assert_eq!(local_rows, vec!["r1".to_string(), "r2".to_string()]);

    client.leave().await?;
    Ok(())
}
