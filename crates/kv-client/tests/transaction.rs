//! End-to-end transactions against the in-memory cluster

use proven_cluster::MockCluster;
use proven_common::{Key, TableId};
use proven_coordinator::{CommitConfig, CoordinatorError, OpKind, TaskState, TransactionTask};
use proven_kv_client::{KvError, Transaction};
use proven_protocol::Decision;
use std::sync::Arc;

const MASTER1: &str = "mock:host=master1";
const MASTER2: &str = "mock:host=master2";

const USERS: TableId = TableId(1);
const ORDERS: TableId = TableId(2);

fn cluster() -> Arc<MockCluster> {
    let cluster = Arc::new(MockCluster::with_servers(&[MASTER1, MASTER2]));
    cluster.create_table(USERS, MASTER1).unwrap();
    cluster.create_table(ORDERS, MASTER2).unwrap();
    cluster
}

fn transaction(cluster: &Arc<MockCluster>) -> Transaction {
    Transaction::with_config(
        cluster.client(),
        CommitConfig::default().with_max_ops_per_exchange(2),
    )
}

#[tokio::test]
async fn test_commit_across_servers() {
    let cluster = cluster();
    cluster.write_object(USERS, b"bob", b"stale").unwrap();

    let mut txn = transaction(&cluster);
    txn.write(USERS, "alice", "1").unwrap();
    txn.write(USERS, "bob", "2").unwrap();
    txn.write(USERS, "carol", "3").unwrap();
    txn.write(ORDERS, "o-1", "alice").unwrap();
    txn.remove(ORDERS, "o-0").unwrap();
    assert_eq!(txn.len(), 5);

    assert_eq!(txn.commit().await.unwrap(), Decision::Commit);
    assert_eq!(txn.state(), TaskState::Done);
    assert!(txn.is_committed());

    assert_eq!(cluster.read_object(USERS, b"alice"), Some(b"1".to_vec()));
    assert_eq!(cluster.read_object(USERS, b"bob"), Some(b"2".to_vec()));
    assert_eq!(cluster.read_object(ORDERS, b"o-1"), Some(b"alice".to_vec()));
    assert!(cluster.lock_holders(USERS, b"alice").is_empty());
}

#[tokio::test]
async fn test_remove_applies_on_commit() {
    let cluster = cluster();
    cluster.write_object(ORDERS, b"o-0", b"old").unwrap();

    let mut txn = transaction(&cluster);
    txn.remove(ORDERS, "o-0").unwrap();
    assert_eq!(txn.commit().await.unwrap(), Decision::Commit);
    assert_eq!(cluster.read_object(ORDERS, b"o-0"), None);
}

#[tokio::test]
async fn test_read_your_writes() {
    let cluster = cluster();
    cluster.write_object(USERS, b"alice", b"stored").unwrap();

    let mut txn = transaction(&cluster);
    assert_eq!(
        txn.read_string(USERS, "alice").await.unwrap(),
        Some("stored".to_string())
    );
    assert_eq!(txn.len(), 1);

    // Staged writes and removes shadow the stored value
    txn.write_string(USERS, "alice", "mine").unwrap();
    assert_eq!(txn.read(USERS, "alice").await.unwrap(), Some(b"mine".to_vec()));
    txn.remove(USERS, "alice").unwrap();
    assert_eq!(txn.read(USERS, "alice").await.unwrap(), None);

    // Upserts reuse the staged entry
    assert_eq!(txn.len(), 1);

    // Nothing reached the server yet
    assert_eq!(cluster.read_object(USERS, b"alice"), Some(b"stored".to_vec()));
    assert_eq!(cluster.requests(MASTER1).len(), 1);
}

#[tokio::test]
async fn test_read_missing_object() {
    let cluster = cluster();
    let mut txn = transaction(&cluster);
    assert_eq!(txn.read(USERS, "nobody").await.unwrap(), None);
    assert!(txn.is_empty());
}

#[tokio::test]
async fn test_read_follows_moved_table() {
    let cluster = cluster();
    cluster.write_object(USERS, b"alice", b"here").unwrap();

    let mut warm = transaction(&cluster);
    warm.read(USERS, "alice").await.unwrap();
    cluster.move_table(USERS, MASTER2).unwrap();

    let mut txn = transaction(&cluster);
    assert_eq!(txn.read(USERS, "alice").await.unwrap(), Some(b"here".to_vec()));
    assert_eq!(cluster.invalidated_tables(), vec![USERS]);
}

#[tokio::test]
async fn test_concurrent_commits() {
    let cluster = cluster();
    cluster.write_object(USERS, b"alice", b"1").unwrap();

    let mut writer = transaction(&cluster);
    writer.write(USERS, "alice", "2").unwrap();
    let mut reader = transaction(&cluster);
    assert_eq!(reader.read(USERS, "alice").await.unwrap(), Some(b"1".to_vec()));
    reader.write(ORDERS, "o-1", "alice").unwrap();

    cluster.hold_replies(MASTER1).unwrap();
    let writer_task = tokio::spawn(async move { writer.commit().await });
    tokio::task::yield_now().await;
    cluster.release_replies(MASTER1).unwrap();
    assert_eq!(writer_task.await.unwrap().unwrap(), Decision::Commit);

    assert_eq!(reader.commit().await.unwrap(), Decision::Commit);
    assert_eq!(cluster.read_object(USERS, b"alice"), Some(b"2".to_vec()));
    assert_eq!(cluster.read_object(ORDERS, b"o-1"), Some(b"alice".to_vec()));
}

#[tokio::test]
async fn test_conflicting_commit_aborts() {
    let cluster = cluster();

    // A competing transaction holds the lock on alice
    let mut holder = TransactionTask::new(cluster.client(), CommitConfig::default());
    holder
        .insert(Key::new(USERS, "alice"), OpKind::Write, b"theirs".to_vec())
        .unwrap();
    holder.step().unwrap();
    holder.step().unwrap();

    let mut txn = transaction(&cluster);
    txn.write(USERS, "alice", "ours").unwrap();
    txn.write(ORDERS, "o-1", "ours").unwrap();
    assert_eq!(txn.commit().await.unwrap(), Decision::Abort);

    assert_eq!(cluster.read_object(USERS, b"alice"), None);
    assert_eq!(cluster.read_object(ORDERS, b"o-1"), None);
    assert!(cluster.lock_holders(ORDERS, b"o-1").is_empty());
}

#[tokio::test]
async fn test_unknown_table() {
    let cluster = cluster();
    let mut txn = transaction(&cluster);
    txn.write(TableId(99), "k", "v").unwrap();

    match txn.commit().await {
        Err(KvError::Coordinator(CoordinatorError::TableDoesntExist(table))) => {
            assert_eq!(table, TableId(99));
        }
        other => panic!("Expected TableDoesntExist, got {:?}", other),
    }
    assert_eq!(txn.state(), TaskState::Done);
}

#[tokio::test]
async fn test_commit_only_once() {
    let cluster = cluster();
    let mut txn = transaction(&cluster);
    txn.write(USERS, "alice", "1").unwrap();
    txn.commit().await.unwrap();

    assert!(matches!(txn.write(USERS, "bob", "2"), Err(KvError::Committed)));
    assert!(matches!(txn.read(USERS, "alice").await, Err(KvError::Committed)));
    assert!(matches!(txn.commit().await, Err(KvError::Committed)));
}

#[tokio::test]
async fn test_empty_commit() {
    let cluster = cluster();
    let mut txn = transaction(&cluster);
    assert_eq!(txn.commit().await.unwrap(), Decision::Commit);
    assert_eq!(txn.state(), TaskState::Init);
}
