//! Integration tests for the change feed trigger pipeline.
//!
//! This test suite validates, against a live PostgreSQL:
//! - Committed inserts/updates/deletes emit exactly one notification with
//!   entity/action/id derived from the triggering row
//! - Rolled-back transactions emit nothing
//! - Table-to-entity aliasing (work_item -> tasks, decision_log -> decisions)
//! - Scopeless tables (agent_session) emit a null projectId
//! - Raw payloads decode through the normalizer with millisecond timestamps
//! - Trigger installation is idempotent and verifiable
//! - Per-source FIFO ordering on a single listening connection
//!
//! Tests run in a scratch schema per test and skip (with a note on stderr)
//! when no database is reachable. NOTIFY channels are database-global, so
//! every assertion filters received payloads by the record ids the test
//! created.

use std::time::Duration;

use sqlx::postgres::{PgListener, PgPoolOptions};
use uuid::Uuid;

use praxis_db::test_fixtures::{TestDatabase, DEFAULT_TEST_DATABASE_URL};
use praxis_db::{changefeed, Action, ChangeEvent, Entity};

/// Connect to the test database, migrated into a fresh scratch schema, or
/// `None` (test skipped) when the database is unreachable.
async fn try_database() -> Option<TestDatabase> {
    dotenvy::dotenv().ok();
    let url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_TEST_DATABASE_URL.to_string());

    let probe = tokio::time::timeout(
        Duration::from_secs(2),
        PgPoolOptions::new().max_connections(1).connect(&url),
    )
    .await;
    match probe {
        Ok(Ok(pool)) => {
            pool.close().await;
            Some(TestDatabase::new_migrated().await)
        }
        _ => {
            eprintln!("skipping: test database unreachable at {url}");
            None
        }
    }
}

/// Receive notifications until one carries the given record id, with a
/// deadline. Panics on timeout.
async fn await_change(listener: &mut PgListener, id: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timeout waiting for change notification for id {id}"));
        let notification = tokio::time::timeout(remaining, listener.recv())
            .await
            .unwrap_or_else(|_| panic!("timeout waiting for change notification for id {id}"))
            .expect("listener connection failed");

        let value: serde_json::Value =
            serde_json::from_str(notification.payload()).expect("payload is not valid JSON");
        if value["id"] == id {
            return value;
        }
        // A payload from a concurrently running test; keep waiting.
    }
}

/// Collect the ids of every notification received up to and including the
/// one for `stop_id`, restricted to `ours`.
async fn collect_until(listener: &mut PgListener, ours: &[String], stop_id: &str) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timeout waiting for change notification for id {stop_id}"));
        let notification = tokio::time::timeout(remaining, listener.recv())
            .await
            .unwrap_or_else(|_| panic!("timeout waiting for change notification for id {stop_id}"))
            .expect("listener connection failed");

        let value: serde_json::Value =
            serde_json::from_str(notification.payload()).expect("payload is not valid JSON");
        let id = value["id"].as_str().unwrap_or_default().to_string();
        if ours.contains(&id) {
            seen.push(id.clone());
        }
        if id == stop_id {
            return seen;
        }
    }
}

async fn create_project(test_db: &TestDatabase, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO project (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(name)
        .execute(test_db.db.pool())
        .await
        .expect("Failed to create project");
    id
}

#[tokio::test]
async fn test_insert_emits_change_with_scope() {
    let Some(test_db) = try_database().await else {
        return;
    };
    let mut listener = changefeed::listen(test_db.db.pool()).await.unwrap();

    let project_id = create_project(&test_db, "scope-test").await;
    let task_id = Uuid::new_v4();
    sqlx::query("INSERT INTO work_item (id, project_id, title) VALUES ($1, $2, 'write tests')")
        .bind(task_id)
        .bind(project_id)
        .execute(test_db.db.pool())
        .await
        .unwrap();

    let change = await_change(&mut listener, &task_id.to_string()).await;
    assert_eq!(change["entity"], "tasks");
    assert_eq!(change["action"], "insert");
    assert_eq!(change["id"], task_id.to_string());
    assert_eq!(change["projectId"], project_id.to_string());

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_update_emits_update_action() {
    let Some(test_db) = try_database().await else {
        return;
    };
    let mut listener = changefeed::listen(test_db.db.pool()).await.unwrap();

    let project_id = create_project(&test_db, "update-test").await;
    let task_id = Uuid::new_v4();
    sqlx::query("INSERT INTO work_item (id, project_id, title) VALUES ($1, $2, 'open me')")
        .bind(task_id)
        .bind(project_id)
        .execute(test_db.db.pool())
        .await
        .unwrap();
    await_change(&mut listener, &task_id.to_string()).await;

    sqlx::query("UPDATE work_item SET status = 'done' WHERE id = $1")
        .bind(task_id)
        .execute(test_db.db.pool())
        .await
        .unwrap();

    let change = await_change(&mut listener, &task_id.to_string()).await;
    assert_eq!(change["entity"], "tasks");
    assert_eq!(change["action"], "update");
    assert_eq!(change["projectId"], project_id.to_string());

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_delete_aliases_decision_log_to_decisions() {
    let Some(test_db) = try_database().await else {
        return;
    };
    let mut listener = changefeed::listen(test_db.db.pool()).await.unwrap();

    let project_id = create_project(&test_db, "alias-test").await;
    let decision_id = Uuid::new_v4();
    sqlx::query("INSERT INTO decision_log (id, project_id, decision) VALUES ($1, $2, 'use cats')")
        .bind(decision_id)
        .bind(project_id)
        .execute(test_db.db.pool())
        .await
        .unwrap();
    await_change(&mut listener, &decision_id.to_string()).await;

    // The id must come from the OLD row, the entity from the alias table.
    sqlx::query("DELETE FROM decision_log WHERE id = $1")
        .bind(decision_id)
        .execute(test_db.db.pool())
        .await
        .unwrap();

    let change = await_change(&mut listener, &decision_id.to_string()).await;
    assert_eq!(change["entity"], "decisions");
    assert_eq!(change["action"], "delete");
    assert_eq!(change["id"], decision_id.to_string());

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_rollback_emits_nothing() {
    let Some(test_db) = try_database().await else {
        return;
    };
    let mut listener = changefeed::listen(test_db.db.pool()).await.unwrap();

    let project_id = create_project(&test_db, "rollback-test").await;
    await_change(&mut listener, &project_id.to_string()).await;

    let doomed_id = Uuid::new_v4();
    let mut tx = test_db.db.pool().begin().await.unwrap();
    sqlx::query("INSERT INTO context_entry (id, project_id, title) VALUES ($1, $2, 'doomed')")
        .bind(doomed_id)
        .bind(project_id)
        .execute(&mut *tx)
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    // A committed sentinel row proves the channel stayed live; NOTIFY is
    // per-connection FIFO, so the doomed id would have arrived first.
    let sentinel_id = Uuid::new_v4();
    sqlx::query("INSERT INTO context_entry (id, project_id, title) VALUES ($1, $2, 'sentinel')")
        .bind(sentinel_id)
        .bind(project_id)
        .execute(test_db.db.pool())
        .await
        .unwrap();

    let ours = vec![doomed_id.to_string(), sentinel_id.to_string()];
    let seen = collect_until(&mut listener, &ours, &sentinel_id.to_string()).await;
    assert_eq!(seen, vec![sentinel_id.to_string()]);

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_scopeless_table_emits_null_scope() {
    let Some(test_db) = try_database().await else {
        return;
    };
    let mut listener = changefeed::listen(test_db.db.pool()).await.unwrap();

    // agent_session has no project_id column at all; the trigger's
    // exception handler must degrade to null rather than fail the insert.
    let session_id = Uuid::new_v4();
    sqlx::query("INSERT INTO agent_session (id, agent_name) VALUES ($1, 'tester')")
        .bind(session_id)
        .execute(test_db.db.pool())
        .await
        .unwrap();

    let change = await_change(&mut listener, &session_id.to_string()).await;
    assert_eq!(change["entity"], "sessions");
    assert_eq!(change["action"], "insert");
    assert!(change["projectId"].is_null());

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_payload_decodes_as_change_event() {
    let Some(test_db) = try_database().await else {
        return;
    };
    let mut listener = changefeed::listen(test_db.db.pool()).await.unwrap();

    let project_id = create_project(&test_db, "decode-test").await;
    let naming_id = Uuid::new_v4();
    sqlx::query("INSERT INTO naming_entry (id, project_id, term) VALUES ($1, $2, 'widget')")
        .bind(naming_id)
        .bind(project_id)
        .execute(test_db.db.pool())
        .await
        .unwrap();

    let change = await_change(&mut listener, &naming_id.to_string()).await;

    // The exact wire bytes must pass the normalizer.
    let event = ChangeEvent::from_wire(&change.to_string()).expect("payload rejected by normalizer");
    assert_eq!(event.entity, Entity::Naming);
    assert_eq!(event.action, Action::Insert);
    assert_eq!(event.id, naming_id.to_string());
    assert_eq!(event.project_id.as_deref(), Some(project_id.to_string().as_str()));

    // Timestamp is ISO-8601 UTC with milliseconds and a trailing Z.
    let at = change["at"].as_str().unwrap();
    assert!(at.ends_with('Z'), "timestamp not UTC: {at}");
    assert_eq!(at.len(), "2025-10-30T21:00:00.000Z".len(), "unexpected precision: {at}");
    let delta = chrono::Utc::now() - event.at;
    assert!(delta.num_seconds().abs() < 60, "timestamp far from now: {at}");

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_install_is_idempotent() {
    let Some(test_db) = try_database().await else {
        return;
    };

    // Migration already installed the feed once; two more rounds must not
    // error or duplicate triggers.
    changefeed::install(test_db.db.pool()).await.unwrap();
    changefeed::install(test_db.db.pool()).await.unwrap();

    let statuses = changefeed::verify(test_db.db.pool()).await.unwrap();
    assert_eq!(statuses.len(), Entity::ALL.len());
    for status in &statuses {
        assert!(
            status.healthy(),
            "{} should be healthy after reinstall",
            status.table
        );
    }

    // One trigger per table, not one per install() call.
    let mut listener = changefeed::listen(test_db.db.pool()).await.unwrap();
    let project_id = create_project(&test_db, "idempotent-test").await;
    let change = await_change(&mut listener, &project_id.to_string()).await;
    assert_eq!(change["entity"], "projects");

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_verify_reports_missing_trigger() {
    let Some(test_db) = try_database().await else {
        return;
    };

    sqlx::query("DROP TRIGGER praxis_notify_change ON work_item")
        .execute(test_db.db.pool())
        .await
        .unwrap();

    let statuses = changefeed::verify(test_db.db.pool()).await.unwrap();
    for status in &statuses {
        assert!(status.table_exists, "{} should exist", status.table);
        if status.entity == Entity::Tasks {
            assert!(!status.trigger_installed);
            assert!(!status.healthy());
        } else {
            assert!(status.healthy(), "{} should be healthy", status.table);
        }
    }

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_notifications_arrive_in_commit_order() {
    let Some(test_db) = try_database().await else {
        return;
    };
    let mut listener = changefeed::listen(test_db.db.pool()).await.unwrap();

    let project_id = create_project(&test_db, "order-test").await;
    let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    for (i, id) in ids.iter().enumerate() {
        sqlx::query("INSERT INTO work_item (id, project_id, title) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(project_id)
            .bind(format!("task {i}"))
            .execute(test_db.db.pool())
            .await
            .unwrap();
    }

    let ours: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let seen = collect_until(&mut listener, &ours, ours.last().unwrap()).await;
    assert_eq!(seen, ours, "events must arrive in emission order");

    test_db.cleanup().await;
}
