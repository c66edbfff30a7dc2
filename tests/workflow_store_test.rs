//! Store durability against a file-backed database: state survives
//! reconnection and the database file is portable.

use swarmguard::domain::models::{ScheduleConfig, Task, TaskKind, Workflow, WorkflowExecution};
use swarmguard::infrastructure::database::{DatabaseConnection, WorkflowStore};

fn workflow(name: &str) -> Workflow {
    let mut wf = Workflow::new(name)
        .with_task(Task::new("fetch", TaskKind::Http).with_url("http://svc/a"))
        .with_task(Task::new("score", TaskKind::Model).depends_on(&["fetch"]));
    wf.description = "durable".to_string();
    wf
}

#[tokio::test]
async fn test_state_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("swarm.db");
    let url = format!("sqlite:{}", db_path.display());

    let execution_id;
    {
        let db = DatabaseConnection::new(&url).await.unwrap();
        db.migrate().await.unwrap();
        let store = WorkflowStore::new(db.pool().clone());

        store.put_workflow(&workflow("durable-wf")).await.unwrap();
        let exec = WorkflowExecution::begin("durable-wf");
        execution_id = exec.workflow_id.clone();
        store.put_execution(&exec).await.unwrap();
        store
            .put_schedule(&ScheduleConfig::cron("durable-wf", "0 30 1 * * *"))
            .await
            .unwrap();
        db.close().await;
    }

    // Fresh connection, fresh (empty) caches: everything reads from disk.
    let db = DatabaseConnection::new(&url).await.unwrap();
    db.migrate().await.unwrap();
    let store = WorkflowStore::new(db.pool().clone());

    let wf = store.get_workflow("durable-wf").await.unwrap();
    assert_eq!(wf, workflow("durable-wf"));

    let exec = store.get_execution(&execution_id).await.unwrap();
    assert_eq!(exec.workflow_name, "durable-wf");

    let listed = store
        .list_executions("durable-wf", None, None, 10)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let schedule = store.get_schedule("durable-wf").await.unwrap();
    assert_eq!(schedule.cron_expr.as_deref(), Some("0 30 1 * * *"));

    db.close().await;
}

#[tokio::test]
async fn test_database_file_is_relocatable() {
    let dir = tempfile::tempdir().unwrap();
    let original = dir.path().join("origin.db");

    {
        let db = DatabaseConnection::new(&format!("sqlite:{}", original.display()))
            .await
            .unwrap();
        db.migrate().await.unwrap();
        let store = WorkflowStore::new(db.pool().clone());
        store.put_workflow(&workflow("mobile")).await.unwrap();
        db.close().await;
    }

    // Move the file; no absolute paths are encoded inside it.
    let moved = dir.path().join("moved.db");
    std::fs::rename(&original, &moved).unwrap();

    let db = DatabaseConnection::new(&format!("sqlite:{}", moved.display()))
        .await
        .unwrap();
    db.migrate().await.unwrap();
    let store = WorkflowStore::new(db.pool().clone());
    assert!(store.get_workflow("mobile").await.is_ok());
    db.close().await;
}

#[tokio::test]
async fn test_version_history_accumulates_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("v.db").display());
    let db = DatabaseConnection::new(&url).await.unwrap();
    db.migrate().await.unwrap();
    let store = WorkflowStore::new(db.pool().clone());

    for revision in 1..=3 {
        let mut wf = workflow("evolving");
        wf.description = format!("revision {revision}");
        store.put_workflow(&wf).await.unwrap();
    }

    let versions = store.get_workflow_versions("evolving").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].description, "revision 1");
    assert_eq!(versions[1].description, "revision 2");
    assert_eq!(
        store.get_workflow("evolving").await.unwrap().description,
        "revision 3"
    );
    db.close().await;
}
