use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hypershell::client::ClientOptions;
use hypershell::cluster::run_local_cluster;
use hypershell::config::Settings;
use hypershell::server::receiver::FailureSink;
use hypershell::server::submitter::TaskSource;
use hypershell::server::ServerOptions;
use hypershell::store::{TaskFilter, TaskStore};

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn test_server_options(lines: &[&str]) -> ServerOptions {
    let mut options = ServerOptions::new(&Settings::default());
    options.port = 0;
    options.bundlewait = 0;
    options.wait = 1;
    options.evict = 10;
    options.source = Some(TaskSource::Lines(
        lines.iter().map(|line| line.to_string()).collect(),
    ));
    options
}

fn test_client_options() -> ClientOptions {
    let mut options = ClientOptions::new(&Settings::default());
    options.bundlewait = 0;
    options.heartrate = 1;
    options
}

async fn run(
    server: ServerOptions,
    client: ClientOptions,
    num_clients: usize,
) -> i32 {
    tokio::time::timeout(
        TEST_TIMEOUT,
        run_local_cluster(
            server,
            client,
            num_clients,
            CancellationToken::new(),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("cluster timed out")
    .expect("cluster failed")
}

/// Four echo tasks over two executors in no-db mode: all succeed and the
/// redirected output holds every line.
#[tokio::test]
async fn echo_four_no_db() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("task.out");

    let mut server = test_server_options(&["1", "2", "3", "4"]);
    server.no_db = true;
    server.queuesize = 4;
    let mut client = test_client_options();
    client.num_tasks = 2;
    client.template = "echo {}".to_string();
    client.output_path = Some(out_path.clone());

    let code = run(server, client, 1).await;
    assert_eq!(code, 0);

    let output = std::fs::read_to_string(&out_path).unwrap();
    let mut lines: Vec<&str> = output.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["1", "2", "3", "4"]);
}

/// The failure sink receives exactly the args of the failing task.
#[tokio::test]
async fn failure_sieve() {
    let dir = tempfile::tempdir().unwrap();
    let failures = dir.path().join("failures.txt");

    let mut server = test_server_options(&["true", "false", "true"]);
    server.no_db = true;
    server.queuesize = 2;
    server.failure_sink = Some(FailureSink::File(failures.clone()));
    let client = test_client_options();

    let code = run(server, client, 1).await;
    assert_eq!(code, 1, "a failed task makes the cluster exit non-zero");

    let sieve = std::fs::read_to_string(&failures).unwrap();
    assert_eq!(sieve.lines().collect::<Vec<_>>(), vec!["false"]);
}

/// `max_retries = 2` produces three linked attempts of a failing task.
#[tokio::test]
async fn retry_until_attempts_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");

    let mut server = test_server_options(&["false"]);
    server.database.file = Some(db_path.to_string_lossy().into_owned());
    server.max_retries = 2;
    let client = test_client_options();

    let code = run(server, client, 1).await;
    assert_eq!(code, 1, "all attempts failed");

    let mut database = hypershell::config::DatabaseSettings::default();
    database.file = Some(db_path.to_string_lossy().into_owned());
    let store = TaskStore::connect(&database).await.unwrap();
    let mut rows = store.search(&TaskFilter::default()).await.unwrap();
    rows.sort_by_key(|task| task.attempt);
    assert_eq!(rows.len(), 3);
    let mut attempts: Vec<i32> = rows.iter().map(|task| task.attempt).collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2, 3]);
    for row in &rows {
        assert_eq!(row.args, "false");
        assert!(row.is_failed());
    }
    assert_eq!(rows[1].previous_id, Some(rows[0].id));
    assert_eq!(rows[2].previous_id, Some(rows[1].id));
    // the chain ends on an unretried failure
    assert!(rows[0].retried && rows[1].retried && !rows[2].retried);
}

/// A single-slot queue forces a strict hand-off between the scheduler and
/// the dispatcher; every task still completes.
#[tokio::test]
async fn single_slot_queue_hand_off() {
    let lines: Vec<String> = (0..10).map(|i| format!("test {i} -lt 5")).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let mut server = test_server_options(&refs);
    server.no_db = true;
    server.queuesize = 1;
    server.bundlesize = 1;
    let mut client = test_client_options();
    client.num_tasks = 2;

    // `test i -lt 5` fails for half the inputs: both outcomes flow back
    let code = run(server, client, 1).await;
    assert_eq!(code, 1);
}

/// Tasks in db mode land as completed rows with matching args.
#[tokio::test]
async fn db_mode_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");

    let mut server = test_server_options(&["echo a", "echo b", "echo c"]);
    server.database.file = Some(db_path.to_string_lossy().into_owned());
    server.bundlesize = 2;
    let mut client = test_client_options();
    client.num_tasks = 2;
    client.output_path = Some(dir.path().join("out.txt"));

    let code = run(server, client, 1).await;
    assert_eq!(code, 0);

    let mut database = hypershell::config::DatabaseSettings::default();
    database.file = Some(db_path.to_string_lossy().into_owned());
    let store = TaskStore::connect(&database).await.unwrap();
    let rows = store.search(&TaskFilter::default()).await.unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.exit_status, Some(0));
        assert!(row.schedule_time.is_some());
        assert!(row.completion_time.is_some());
        assert!(row.schedule_time.unwrap() <= row.completion_time.unwrap());
        assert!(row.client_id.is_some());
    }
    let mut args: Vec<&str> = rows.iter().map(|row| row.args.as_str()).collect();
    args.sort_unstable();
    assert_eq!(args, vec!["echo a", "echo b", "echo c"]);
}
