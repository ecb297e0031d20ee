use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hypershell::autoscale::{Autoscaler, AutoscalerOptions, Policy};
use hypershell::config::DatabaseSettings;
use hypershell::server::registry::{Registration, Registry};
use hypershell::store::{TaskFilter, TaskStore};
use hypershell::task::Task;

fn launch_count(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .count()
}

/// Dynamic policy under sustained pressure: with `period = 5`, `factor = 1`,
/// `min = 0`, `max = 4` and a backlog keeping `toc / avg_duration` far above
/// one, the launcher is invoked at least three times over 15 seconds; once
/// the backlog drains the launches stop entirely (scale to zero when idle).
#[tokio::test]
async fn dynamic_policy_launches_under_pressure_then_goes_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let launch_log = dir.path().join("launches.log");
    let mut database = DatabaseSettings::default();
    database.file = Some(dir.path().join("tasks.db").to_string_lossy().into_owned());
    let store = TaskStore::connect(&database).await.unwrap();

    // seed a measurable average duration with a few completed tasks
    let seed: Vec<Task> = (0..3)
        .map(|i| Task::new(&format!("echo seed {i}"), &BTreeMap::new()).unwrap())
        .collect();
    store.insert(&seed).await.unwrap();
    let mut claimed = store.claim_next(3, false).await.unwrap();
    for task in &mut claimed {
        let now = Utc::now();
        task.client_id = Some(Uuid::new_v4());
        task.client_host = Some("node-1".to_string());
        task.command = Some(task.args.clone());
        task.start_time = Some(now);
        task.completion_time = Some(now);
        task.exit_status = Some(0);
        task.waited = Some(0);
        task.duration = Some(10);
        assert!(store.complete(task).await.unwrap());
    }
    // a deep backlog: 200 tasks over one executor at 10s each keeps the
    // estimated time-to-completion far above the average duration
    let backlog: Vec<Task> = (0..200)
        .map(|i| Task::new(&format!("echo {i}"), &BTreeMap::new()).unwrap())
        .collect();
    store.insert(&backlog).await.unwrap();

    // one registered single-executor client provides the throughput sample
    let registry = Arc::new(RwLock::new(Registry::new()));
    registry.write().await.register(Registration::new(
        Uuid::new_v4(),
        "node-1".to_string(),
        1,
        CancellationToken::new(),
    ));

    // the fake launcher appends a line and comments out the client argv,
    // so invocations are counted without starting anything
    let shutdown = CancellationToken::new();
    let autoscaler = Autoscaler {
        options: AutoscalerOptions {
            policy: Policy::Dynamic,
            factor: 1.0,
            period: 5,
            init: 1,
            min: 0,
            max: 4,
            launcher: format!("echo launched >> {} #", launch_log.display()),
            client_command: "hypershell client -H localhost".to_string(),
        },
        store: store.clone(),
        registry: registry.clone(),
        shutdown: shutdown.clone(),
    };
    let handle = tokio::spawn(autoscaler.run());

    // pressure stays high for three full periods
    tokio::time::sleep(Duration::from_secs(16)).await;

    // drain: cancel the backlog so remaining work (and pressure) reach zero
    let remaining = store
        .search(&TaskFilter {
            remaining: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<Uuid> = remaining.iter().map(|task| task.id).collect();
    store.cancel(&ids).await.unwrap();

    // let any cycle already underway finish before taking the baseline
    tokio::time::sleep(Duration::from_secs(6)).await;
    let launched = launch_count(&launch_log);
    assert!(
        (3..=5).contains(&launched),
        "expected 3-5 launches under pressure, saw {launched}"
    );

    // two further periods of idleness: no additional launches
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(
        launch_count(&launch_log),
        launched,
        "launches continued after the backlog drained"
    );

    shutdown.cancel();
    let _ = handle.await;
}
