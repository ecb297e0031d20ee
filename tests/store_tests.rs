use std::collections::BTreeMap;

use chrono::Utc;
use hypershell::config::DatabaseSettings;
use hypershell::store::{TaskFilter, TaskStore};
use hypershell::task::{Task, EXIT_STATUS_CANCELLED};

async fn memory_store() -> TaskStore {
    TaskStore::connect(&DatabaseSettings::default())
        .await
        .expect("in-memory store")
}

fn task(args: &str) -> Task {
    Task::new(args, &BTreeMap::new()).unwrap()
}

fn tagged_task(args: &str, key: &str, value: &str) -> Task {
    Task::new(args, &BTreeMap::from([(key.to_string(), value.to_string())])).unwrap()
}

/// Simulate a client outcome for a claimed task.
fn finish(task: &mut Task, exit_status: i32) {
    let now = Utc::now();
    task.client_id = Some(uuid::Uuid::new_v4());
    task.client_host = Some("node-1".to_string());
    task.command = Some(task.args.clone());
    task.start_time = Some(now);
    task.completion_time = Some(now);
    task.exit_status = Some(exit_status);
    task.waited = Some(0);
    task.duration = Some(1);
}

#[tokio::test]
async fn insert_and_fetch_round_trip() {
    let store = memory_store().await;
    let task = tagged_task("echo hello", "site", "aa");
    store.insert(std::slice::from_ref(&task)).await.unwrap();
    let fetched = store.fetch(task.id).await.unwrap().unwrap();
    assert_eq!(fetched.args, "echo hello");
    assert_eq!(fetched.attempt, 1);
    assert_eq!(fetched.tags.get("site").map(String::as_str), Some("aa"));
    assert!(fetched.is_schedulable());
    assert!(store.fetch(uuid::Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_stamps_schedule_and_never_returns_twice() {
    let store = memory_store().await;
    let tasks: Vec<Task> = (0..5).map(|i| task(&format!("echo {i}"))).collect();
    store.insert(&tasks).await.unwrap();

    let first = store.claim_next(3, false).await.unwrap();
    assert_eq!(first.len(), 3);
    for claimed in &first {
        assert!(claimed.schedule_time.is_some());
        assert!(claimed.server_id.is_some());
    }
    // submit order preserved
    assert_eq!(first[0].args, "echo 0");

    let second = store.claim_next(10, false).await.unwrap();
    assert_eq!(second.len(), 2);
    let mut all: Vec<_> = first.iter().chain(&second).map(|t| t.id).collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 5);
    assert!(store.claim_next(10, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_claims_are_disjoint() {
    let store = memory_store().await;
    let tasks: Vec<Task> = (0..40).map(|i| task(&format!("echo {i}"))).collect();
    store.insert(&tasks).await.unwrap();

    let claims: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next(10, false).await.unwrap() })
        })
        .collect();
    let mut claimed = Vec::new();
    for handle in claims {
        claimed.extend(handle.await.unwrap().into_iter().map(|t| t.id));
    }
    let total = claimed.len();
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), total, "a task was claimed twice");
    assert_eq!(total, 40);
}

#[tokio::test]
async fn complete_first_write_wins() {
    let store = memory_store().await;
    store.insert(&[task("true")]).await.unwrap();
    let mut claimed = store.claim_next(1, false).await.unwrap().remove(0);

    finish(&mut claimed, 0);
    assert!(store.complete(&claimed).await.unwrap());
    // replay with a conflicting outcome is rejected
    let mut conflicting = claimed.clone();
    conflicting.exit_status = Some(9);
    assert!(!store.complete(&conflicting).await.unwrap());
    let fetched = store.fetch(claimed.id).await.unwrap().unwrap();
    assert_eq!(fetched.exit_status, Some(0));
}

#[tokio::test]
async fn revert_interrupted_restores_schedulable() {
    let store = memory_store().await;
    store.insert(&[task("a"), task("b"), task("c")]).await.unwrap();
    let mut claimed = store.claim_next(3, false).await.unwrap();
    // one task completes, two are interrupted
    finish(&mut claimed[0], 0);
    store.complete(&claimed[0]).await.unwrap();

    let reverted = store.revert_interrupted().await.unwrap();
    assert_eq!(reverted, 2);
    assert_eq!(store.count_interrupted().await.unwrap(), 0);
    let reclaimed = store.claim_next(10, false).await.unwrap();
    assert_eq!(reclaimed.len(), 2);
    // the completed row was untouched
    let done = store.fetch(claimed[0].id).await.unwrap().unwrap();
    assert_eq!(done.exit_status, Some(0));
}

#[tokio::test]
async fn revert_orphaned_targets_one_client() {
    let store = memory_store().await;
    store.insert(&[task("a"), task("b")]).await.unwrap();
    let claimed = store.claim_next(2, false).await.unwrap();
    let evicted = uuid::Uuid::new_v4();
    let healthy = uuid::Uuid::new_v4();
    store
        .attribute(evicted, "node-1", &[claimed[0].id])
        .await
        .unwrap();
    store
        .attribute(healthy, "node-2", &[claimed[1].id])
        .await
        .unwrap();

    assert_eq!(store.revert_orphaned(evicted).await.unwrap(), 1);
    let orphan = store.fetch(claimed[0].id).await.unwrap().unwrap();
    assert!(orphan.is_schedulable());
    assert!(orphan.client_id.is_none());
    let kept = store.fetch(claimed[1].id).await.unwrap().unwrap();
    assert!(!kept.is_schedulable());
    assert_eq!(kept.client_id, Some(healthy));
}

#[tokio::test]
async fn retry_rows_link_attempts_and_inherit_tags() {
    let store = memory_store().await;
    let original = tagged_task("false", "site", "aa");
    store.insert(std::slice::from_ref(&original)).await.unwrap();
    let mut claimed = store.claim_next(1, false).await.unwrap().remove(0);
    finish(&mut claimed, 1);
    store.complete(&claimed).await.unwrap();

    assert_eq!(store.insert_retries(2, 10).await.unwrap(), 1);
    // the original is marked retried, so no second retry appears
    assert_eq!(store.insert_retries(2, 10).await.unwrap(), 0);

    let retry = store.claim_next(1, false).await.unwrap().remove(0);
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.previous_id, Some(original.id));
    assert_eq!(retry.tags.get("site").map(String::as_str), Some("aa"));
    let first = store.fetch(original.id).await.unwrap().unwrap();
    assert!(first.retried);
    assert!(first.is_failed());
}

#[tokio::test]
async fn retry_respects_attempt_limit() {
    let store = memory_store().await;
    store.insert(&[task("false")]).await.unwrap();
    let mut claimed = store.claim_next(1, false).await.unwrap().remove(0);
    finish(&mut claimed, 1);
    store.complete(&claimed).await.unwrap();

    // attempts capped at 1: no retries at all
    assert_eq!(store.insert_retries(1, 10).await.unwrap(), 0);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn eager_claim_prefers_retries() {
    let store = memory_store().await;
    store.insert(&[task("false")]).await.unwrap();
    let mut failed = store.claim_next(1, false).await.unwrap().remove(0);
    finish(&mut failed, 1);
    store.complete(&failed).await.unwrap();
    store.insert_retries(2, 10).await.unwrap();
    // a novel task submitted after the retry row
    store.insert(&[task("echo new")]).await.unwrap();

    let eager = store.claim_next(1, true).await.unwrap().remove(0);
    assert!(eager.previous_id.is_some(), "eager mode should pick the retry");
    store.revert_interrupted().await.unwrap();
    let fifo = store.claim_next(2, false).await.unwrap();
    // without eager, plain submit order applies
    assert!(fifo[0].submit_time <= fifo[1].submit_time);
}

#[tokio::test]
async fn cancelled_tasks_are_never_claimed() {
    let store = memory_store().await;
    let victim = task("echo doomed");
    store.insert(&[victim.clone(), task("echo ok")]).await.unwrap();
    assert_eq!(store.cancel(&[victim.id]).await.unwrap(), 1);

    let claimed = store.claim_next(10, false).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].args, "echo ok");
    let cancelled = store.fetch(victim.id).await.unwrap().unwrap();
    assert_eq!(cancelled.exit_status, Some(EXIT_STATUS_CANCELLED));
    // cancelling a complete task is a no-op
    assert_eq!(store.cancel(&[victim.id]).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_removes_rows_and_tags() {
    let store = memory_store().await;
    let victim = tagged_task("echo x", "site", "aa");
    store.insert(std::slice::from_ref(&victim)).await.unwrap();
    assert_eq!(store.delete(&[victim.id]).await.unwrap(), 1);
    assert!(store.fetch(victim.id).await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn search_and_update() {
    let store = memory_store().await;
    store
        .insert(&[tagged_task("true", "group", "g1"), task("false")])
        .await
        .unwrap();
    let mut claimed = store.claim_next(2, false).await.unwrap();
    finish(&mut claimed[0], 0);
    finish(&mut claimed[1], 1);
    for task in &claimed {
        store.complete(task).await.unwrap();
    }

    let failed = store
        .search(&TaskFilter {
            failed: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].args, "false");

    let by_tag = store
        .search(&TaskFilter {
            tags: vec![("group".to_string(), "g1".to_string())],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_tag.len(), 1);
    assert_eq!(by_tag[0].args, "true");

    store.update_field(failed[0].id, "args", "false # fixed").await.unwrap();
    store.set_tag(failed[0].id, "note", "flaky").await.unwrap();
    let updated = store.fetch(failed[0].id).await.unwrap().unwrap();
    assert_eq!(updated.args, "false # fixed");
    assert_eq!(updated.tags.get("note").map(String::as_str), Some("flaky"));
    assert!(store
        .update_field(failed[0].id, "schedule_time", "now")
        .await
        .is_err());
}

#[tokio::test]
async fn counts_and_average_duration() {
    let store = memory_store().await;
    assert_eq!(store.avg_duration(100).await.unwrap(), None);
    store.insert(&[task("a"), task("b"), task("c")]).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 3);
    assert_eq!(store.count_remaining().await.unwrap(), 3);

    let mut claimed = store.claim_next(2, false).await.unwrap();
    assert_eq!(store.count_interrupted().await.unwrap(), 2);
    finish(&mut claimed[0], 0);
    claimed[0].duration = Some(4);
    store.complete(&claimed[0]).await.unwrap();
    assert_eq!(store.count_remaining().await.unwrap(), 2);
    assert_eq!(store.avg_duration(100).await.unwrap(), Some(4.0));
}
