//! Integration tests for the task queries, in particular tunnel-port claims.

use uuid::Uuid;

use tether_db::models::{ComputingKind, ComputingOptions, Task, TaskStatus};
use tether_db::queries::tasks::{self, Launch, NewTask};
use tether_test_utils::{create_test_db, drop_test_db, seed_computing, seed_container};

async fn new_task(pool: &sqlx::PgPool, owner: Uuid) -> Task {
    let container = seed_container(pool).await;
    let computing = seed_computing(pool, ComputingKind::Local).await;
    tasks::insert_task(
        pool,
        &NewTask {
            owner_id: owner,
            name: "notebook".to_owned(),
            container_id: container.id,
            computing_id: computing.id,
            port: Some(8080),
            auth_user: None,
            auth_pass: Some("s3cret!".to_owned()),
            extra_binds: None,
            options: ComputingOptions {
                partition: Some("debug".to_owned()),
                ..Default::default()
            },
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn insert_starts_in_created() {
    let (pool, db_name) = create_test_db().await;
    let owner = Uuid::new_v4();

    let task = new_task(&pool, owner).await;
    assert_eq!(task.status, TaskStatus::Created);
    assert_eq!(task.port, Some(8080));
    assert_eq!(task.computing_options().partition.as_deref(), Some("debug"));

    let listed = tasks::list_tasks_for_owner(&pool, owner).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(tasks::list_tasks_for_owner(&pool, Uuid::new_v4()).await.unwrap().is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn launch_does_not_demote_a_running_task() {
    let (pool, db_name) = create_test_db().await;
    let task = new_task(&pool, Uuid::new_v4()).await;

    // The agent callback won the race.
    assert!(tasks::set_task_address(&pool, task.id, "10.1.2.3", 51234).await.unwrap());

    let launched = tasks::record_launch(
        &pool,
        task.id,
        &Launch {
            tid: Some(task.id.to_string()),
            pid: Some(42),
            status: Some(TaskStatus::Submitted),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(launched.status, TaskStatus::Running);
    assert_eq!(launched.pid, Some(42));
    assert_eq!(launched.ip.as_deref(), Some("10.1.2.3"));
    assert_eq!(launched.port, Some(51234));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_tunnel_port_is_stable_and_exhausts() {
    let (pool, db_name) = create_test_db().await;
    let owner = Uuid::new_v4();
    let a = new_task(&pool, owner).await;
    let b = new_task(&pool, owner).await;
    let c = new_task(&pool, owner).await;

    assert_eq!(tasks::claim_tunnel_port(&pool, a.id, 7000..=7001).await.unwrap(), Some(7000));
    // Claiming again returns the same port.
    assert_eq!(tasks::claim_tunnel_port(&pool, a.id, 7000..=7001).await.unwrap(), Some(7000));
    assert_eq!(tasks::claim_tunnel_port(&pool, b.id, 7000..=7001).await.unwrap(), Some(7001));
    assert_eq!(tasks::claim_tunnel_port(&pool, c.id, 7000..=7001).await.unwrap(), None);

    // Stopping a releases its port.
    tasks::update_task_status(&pool, a.id, TaskStatus::Stopped).await.unwrap();
    let stopped = tasks::get_task(&pool, a.id).await.unwrap().unwrap();
    assert_eq!(stopped.tunnel_port, None);
    assert_eq!(tasks::claim_tunnel_port(&pool, c.id, 7000..=7001).await.unwrap(), Some(7000));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_claims_never_share_a_port() {
    let (pool, db_name) = create_test_db().await;
    let owner = Uuid::new_v4();
    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(new_task(&pool, owner).await.id);
    }

    let handles: Vec<_> = ids
        .iter()
        .map(|id| {
            let pool = pool.clone();
            let id = *id;
            tokio::spawn(async move { tasks::claim_tunnel_port(&pool, id, 7000..=7005).await })
        })
        .collect();

    let mut ports = Vec::new();
    for handle in handles {
        ports.push(handle.await.unwrap().unwrap().expect("range fits every task"));
    }
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports, vec![7000, 7001, 7002, 7003, 7004, 7005]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_only_from_terminal_status() {
    let (pool, db_name) = create_test_db().await;
    let task = new_task(&pool, Uuid::new_v4()).await;

    assert!(!tasks::delete_terminal_task(&pool, task.id).await.unwrap());
    tasks::update_task_status(&pool, task.id, TaskStatus::Exited).await.unwrap();
    assert!(tasks::delete_terminal_task(&pool, task.id).await.unwrap());
    assert!(tasks::get_task(&pool, task.id).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}
