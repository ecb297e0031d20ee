use std::collections::BTreeMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hypershell::client::{run_client, ClientOptions};
use hypershell::config::Settings;
use hypershell::error::HyperError;
use hypershell::protocol::{Ack, FrameCodec, Hello, Message};
use hypershell::server::{Server, ServerOptions};
use hypershell::store::TaskStore;
use hypershell::task::Task;

const AUTH: &str = "test-cluster-secret";

async fn forever_server(
    dir: &tempfile::TempDir,
    evict: u64,
    shutdown: CancellationToken,
) -> (Server, TaskStore) {
    let mut options = ServerOptions::new(&Settings::default());
    options.port = 0;
    options.auth = AUTH.to_string();
    options.forever = true;
    options.bundlesize = 4;
    options.wait = 1;
    options.evict = evict;
    options.database.file = Some(dir.path().join("tasks.db").to_string_lossy().into_owned());
    let store = TaskStore::connect(&options.database).await.unwrap();
    let server = Server::start(options, shutdown).await.unwrap();
    (server, store)
}

/// A client that pulls a bundle and then vanishes silently is evicted
/// after the heartbeat silence period, and its tasks are reverted so they
/// can be delivered again (at-least-once across client failure).
#[tokio::test]
async fn silent_client_is_evicted_and_tasks_revert() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let (server, store) = forever_server(&dir, 2, shutdown.clone()).await;
    let tasks: Vec<Task> = (0..4)
        .map(|i| Task::new(&format!("echo {i}"), &BTreeMap::new()).unwrap())
        .collect();
    store.insert(&tasks).await.unwrap();

    // hand-rolled client: handshake, pull one bundle, confirm, go silent
    let stream = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new(AUTH));
    let client_id = Uuid::new_v4();
    framed
        .send(Message::Hello(Hello {
            client_id,
            client_host: "ghost".to_string(),
            num_tasks: 4,
            token: AUTH.to_string(),
        }))
        .await
        .unwrap();
    let welcome = framed.next().await.unwrap().unwrap();
    assert!(matches!(welcome, Message::Ack(_)));

    let bundle = loop {
        match framed.next().await.unwrap().unwrap() {
            Message::BundleOut(bundle) => break bundle,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(bundle.len(), 4);
    framed
        .send(Message::Ack(Ack {
            client_id,
            client_host: "ghost".to_string(),
            task_ids: bundle.iter().map(|task| task.id).collect(),
        }))
        .await
        .unwrap();
    // give attribution a moment to land, then disconnect without a word
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(framed);

    // eviction: heartbeat silence beyond 2s, swept every 1s; the sweep
    // removes the registration and reverts the ghost's in-flight tasks
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let registered = server.registry.read().await.active();
        let mut reverted = 0;
        for task in &tasks {
            let row = store.fetch(task.id).await.unwrap().unwrap();
            assert!(row.exit_status.is_none());
            if row.client_id != Some(client_id) {
                reverted += 1;
            }
        }
        if registered == 0 && reverted == tasks.len() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "eviction incomplete (registered={registered}, reverted={reverted})"
        );
        // the forever scheduler may immediately re-claim reverted rows,
        // which is fine: they are schedulable work again, just unattributed
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(30), server.join())
        .await
        .expect("server did not stop")
        .unwrap();
}

/// A client with the wrong pre-shared key is rejected during handshake.
#[tokio::test]
async fn wrong_auth_token_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let (server, _store) = forever_server(&dir, 60, shutdown.clone()).await;

    let mut options = ClientOptions::new(&Settings::default());
    options.host = "localhost".to_string();
    options.port = server.addr.port();
    options.auth = "not-the-secret".to_string();
    let result = tokio::time::timeout(
        Duration::from_secs(30),
        run_client(options, CancellationToken::new(), CancellationToken::new()),
    )
    .await
    .expect("client timed out");
    match result {
        Err(HyperError::Auth(_)) | Err(HyperError::Transport(_)) => {}
        other => panic!("expected auth rejection, got {other:?}"),
    }
    assert!(server.registry.read().await.is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(30), server.join())
        .await
        .expect("server did not stop")
        .unwrap();
}
