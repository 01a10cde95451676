mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{job_queue, rotation_repository, test_db, work_item};
use reelforge::Error;
use reelforge::credentials::{KeyPool, KeyRotationManager, RotatingKey};
use reelforge::database::models::JobStatus;
use reelforge::pipeline::FailOutcome;

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|k| k.to_string()).collect()
}

#[tokio::test]
async fn queue_claims_in_insertion_order() {
    let (_dir, pool) = test_db().await;
    let queue = job_queue(&pool);

    for id in ["a", "b", "c"] {
        queue.enqueue(id, &work_item(id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue().await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(queue.stats().await.unwrap().processing, 3);
}

#[tokio::test]
async fn fail_charges_the_retry_budget() {
    let (_dir, pool) = test_db().await;
    let queue = job_queue(&pool);

    queue.enqueue("once", &work_item("once")).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();
    let outcome = queue.fail("once", "timeout", 3).await.unwrap();
    assert_eq!(outcome, FailOutcome::Requeued { attempts: 1 });
    let job = queue.get_job("once").await.unwrap();
    assert_eq!(job.job_status(), Some(JobStatus::Pending));
    assert_eq!(job.error.as_deref(), Some("timeout"));

    let claimed = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 1);
    queue.fail("once", "timeout", 3).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();
    let outcome = queue.fail("once", "timeout again", 3).await.unwrap();
    assert!(outcome.is_exhausted());
    assert_eq!(outcome.attempts(), 3);

    let job = queue.get_job("once").await.unwrap();
    assert_eq!(job.job_status(), Some(JobStatus::Failed));
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn queue_state_survives_reopening_the_database() {
    let (dir, pool) = test_db().await;
    let queue = job_queue(&pool);
    queue.enqueue("kept", &work_item("kept")).await.unwrap();
    pool.close().await;

    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("reelforge.db").display()
    );
    let reopened = reelforge::database::init_pool(&url).await.unwrap();
    let queue = job_queue(&reopened);
    let job = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(job.id, "kept");
    let item: reelforge::records::WorkItem = job.payload().unwrap();
    assert_eq!(item, work_item("kept"));
}

#[tokio::test]
async fn rotation_advances_and_persists() {
    let (_dir, pool) = test_db().await;
    let pool_keys = keys(&["A", "B"]);

    let manager = KeyRotationManager::new(rotation_repository(&pool));
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(manager.get_next_key("fal:image", &pool_keys, 2).await.unwrap());
    }

    // A fresh manager continues where the last one stopped.
    let manager = KeyRotationManager::new(rotation_repository(&pool));
    for _ in 0..2 {
        seen.push(manager.get_next_key("fal:image", &pool_keys, 2).await.unwrap());
    }
    assert_eq!(seen, vec!["A", "A", "B", "B", "A"]);

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].provider, "fal:image");
    assert_eq!(stats[0].current_key, 1);
    assert_eq!(stats[0].request_count, 1);
}

#[tokio::test]
async fn single_key_pool_keeps_no_state() {
    let (_dir, pool) = test_db().await;
    let manager = KeyRotationManager::new(rotation_repository(&pool));

    for _ in 0..3 {
        let key = manager
            .get_next_key("wavespeed:video", &keys(&["only"]), 1)
            .await
            .unwrap();
        assert_eq!(key, "only");
    }
    assert!(manager.stats().await.unwrap().is_empty());

    let err = manager
        .get_next_key("wavespeed:video", &[], 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoCredentials(_)));
}

#[tokio::test]
async fn rotating_keys_share_one_counter_across_tasks() {
    let (_dir, pool) = test_db().await;
    let manager = Arc::new(KeyRotationManager::new(rotation_repository(&pool)));
    let key = Arc::new(RotatingKey::new(
        manager.clone(),
        "fal:video",
        KeyPool::new(keys(&["A", "B", "C"]), 1),
    ));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..9 {
        let key = key.clone();
        tasks.spawn(async move { key.next().await.unwrap() });
    }
    let mut counts = std::collections::HashMap::new();
    while let Some(result) = tasks.join_next().await {
        *counts.entry(result.unwrap()).or_insert(0) += 1;
    }
    assert_eq!(counts.get("A"), Some(&3));
    assert_eq!(counts.get("B"), Some(&3));
    assert_eq!(counts.get("C"), Some(&3));

    assert!(manager.reset("fal:video").await.unwrap());
    assert_eq!(key.next().await.unwrap(), "A");
}
