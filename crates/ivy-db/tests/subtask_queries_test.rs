//! Integration tests for subtask queries: upsert semantics, dependency
//! round-trips, positions, and status transitions.

use ivy_db::models::{BlockedReason, SubtaskStatus};
use ivy_db::queries::subtasks as db;

use ivy_test_utils::{TestDb, seed_project, seed_subtask, seed_task};

#[tokio::test]
async fn upsert_preserves_existing_fields() {
    let test_db = TestDb::create().await;
    let pool = test_db.pool.clone();
    let project = seed_project(&pool, "/tmp/clone").await;
    let task = seed_task(&pool, project.id).await;

    let original = seed_subtask(&pool, task.id, "iv-1").await;

    // A second sync pass with different content must not overwrite.
    let resynced = db::upsert_subtask(
        &pool,
        &db::NewSubtask {
            task_id: task.id,
            issue_id: "iv-1".into(),
            title: "Rewritten title".into(),
            spec: "Rewritten spec".into(),
            plan: "Rewritten plan".into(),
            position: 99,
        },
    )
    .await
    .unwrap();

    assert_eq!(resynced.id, original.id);
    assert_eq!(resynced.title, original.title);
    assert_eq!(resynced.spec, original.spec);
    assert_eq!(resynced.position, original.position);

    test_db.finish().await;
}

#[tokio::test]
async fn dependency_queries_are_single_round_trips() {
    let test_db = TestDb::create().await;
    let pool = test_db.pool.clone();
    let project = seed_project(&pool, "/tmp/clone").await;
    let task = seed_task(&pool, project.id).await;
    let a = seed_subtask(&pool, task.id, "iv-1").await;
    let b = seed_subtask(&pool, task.id, "iv-2").await;
    let c = seed_subtask(&pool, task.id, "iv-3").await;

    // c depends on both a and b; inserts are idempotent.
    db::insert_dependency(&pool, c.id, a.id).await.unwrap();
    db::insert_dependency(&pool, c.id, a.id).await.unwrap();
    db::insert_dependency(&pool, c.id, b.id).await.unwrap();

    let blocking = db::blocking_dependencies(&pool, c.id).await.unwrap();
    let mut blocking_ids: Vec<_> = blocking.iter().map(|s| s.id).collect();
    blocking_ids.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(blocking_ids, expected);

    let dependents = db::dependents(&pool, a.id).await.unwrap();
    assert_eq!(dependents.len(), 1);
    assert_eq!(dependents[0].id, c.id);

    test_db.finish().await;
}

#[tokio::test]
async fn positions_assign_monotonically() {
    let test_db = TestDb::create().await;
    let pool = test_db.pool.clone();
    let project = seed_project(&pool, "/tmp/clone").await;
    let task = seed_task(&pool, project.id).await;

    assert_eq!(db::next_position(&pool, task.id).await.unwrap(), 1);
    let a = seed_subtask(&pool, task.id, "iv-1").await;
    assert_eq!(a.position, 1);
    let b = seed_subtask(&pool, task.id, "iv-2").await;
    assert_eq!(b.position, 2);

    // Reorders write absolute values.
    db::set_position(&pool, a.id, 5).await.unwrap();
    assert_eq!(db::next_position(&pool, task.id).await.unwrap(), 6);

    test_db.finish().await;
}

#[tokio::test]
async fn transition_uses_optimistic_locking() {
    let test_db = TestDb::create().await;
    let pool = test_db.pool.clone();
    let project = seed_project(&pool, "/tmp/clone").await;
    let task = seed_task(&pool, project.id).await;
    let subtask = seed_subtask(&pool, task.id, "iv-1").await;

    // pending -> ready succeeds once.
    let rows = db::transition_subtask_status(
        &pool,
        subtask.id,
        SubtaskStatus::Pending,
        SubtaskStatus::Ready,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // Replaying the same transition affects zero rows.
    let rows = db::transition_subtask_status(
        &pool,
        subtask.id,
        SubtaskStatus::Pending,
        SubtaskStatus::Ready,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);

    test_db.finish().await;
}

#[tokio::test]
async fn set_status_returns_prior() {
    let test_db = TestDb::create().await;
    let pool = test_db.pool.clone();
    let project = seed_project(&pool, "/tmp/clone").await;
    let task = seed_task(&pool, project.id).await;
    let subtask = seed_subtask(&pool, task.id, "iv-1").await;

    let prior = db::set_subtask_status(
        &pool,
        subtask.id,
        SubtaskStatus::Blocked,
        Some(BlockedReason::Dependency),
    )
    .await
    .unwrap();
    assert_eq!(prior, Some(SubtaskStatus::Pending));

    let prior = db::set_subtask_status(&pool, subtask.id, SubtaskStatus::Ready, None)
        .await
        .unwrap();
    assert_eq!(prior, Some(SubtaskStatus::Blocked));

    let missing = db::set_subtask_status(
        &pool,
        uuid::Uuid::new_v4(),
        SubtaskStatus::Ready,
        None,
    )
    .await
    .unwrap();
    assert_eq!(missing, None);

    test_db.finish().await;
}

#[tokio::test]
async fn retry_counter_and_tokens_accumulate() {
    let test_db = TestDb::create().await;
    let pool = test_db.pool.clone();
    let project = seed_project(&pool, "/tmp/clone").await;
    let task = seed_task(&pool, project.id).await;
    let subtask = seed_subtask(&pool, task.id, "iv-1").await;

    assert_eq!(db::increment_retry_count(&pool, subtask.id).await.unwrap(), 1);
    assert_eq!(db::increment_retry_count(&pool, subtask.id).await.unwrap(), 2);

    db::add_tokens_used(&pool, subtask.id, 300).await.unwrap();
    db::add_tokens_used(&pool, subtask.id, 200).await.unwrap();

    let fresh = db::get_subtask(&pool, subtask.id).await.unwrap().unwrap();
    assert_eq!(fresh.retry_count, 2);
    assert_eq!(fresh.tokens_used, 500);

    test_db.finish().await;
}
