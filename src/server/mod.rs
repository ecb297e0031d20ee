//! Server orchestration: a submitter, scheduler, dispatcher/receiver pair,
//! and eviction sweep wrapped around the shared queue and the task store.

pub mod dispatcher;
pub mod queue;
pub mod receiver;
pub mod registry;
pub mod scheduler;
pub mod submitter;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{DatabaseSettings, Settings, DEFAULT_AUTH};
use crate::error::{HyperError, Result};
use crate::store::TaskStore;
use crate::template::Template;

use dispatcher::DispatcherConfig;
use queue::ServerQueue;
use receiver::{FailureSink, Receiver};
use registry::Registry;
use scheduler::Scheduler;
use submitter::{SubmitSink, Submitter, TaskSource};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind: String,
    pub port: u16,
    pub auth: String,
    pub queuesize: usize,
    pub bundlesize: usize,
    pub bundlewait: u64,
    pub max_retries: u32,
    pub eager: bool,
    pub forever: bool,
    pub restart: bool,
    pub no_db: bool,
    pub no_confirm: bool,
    pub wait: u64,
    pub evict: u64,
    pub failure_sink: Option<FailureSink>,
    pub source: Option<TaskSource>,
    pub submit_template: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub database: DatabaseSettings,
}

impl ServerOptions {
    pub fn new(settings: &Settings) -> Self {
        Self {
            bind: settings.server.bind.clone(),
            port: settings.server.port,
            auth: settings.server.auth.clone(),
            queuesize: settings.server.queuesize,
            bundlesize: settings.server.bundlesize,
            bundlewait: settings.submit.bundlewait,
            max_retries: settings.server.attempts.saturating_sub(1),
            eager: settings.server.eager,
            forever: false,
            restart: false,
            no_db: false,
            no_confirm: false,
            wait: settings.server.wait,
            evict: settings.server.evict,
            failure_sink: None,
            source: None,
            submit_template: None,
            tags: BTreeMap::new(),
            database: settings.database.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerSummary {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Running server instance: bound address, shared state handles for the
/// autoscaler, and the orchestration task.
pub struct Server {
    pub addr: SocketAddr,
    pub registry: Arc<RwLock<Registry>>,
    pub store: Option<TaskStore>,
    handle: JoinHandle<Result<ServerSummary>>,
}

impl Server {
    /// Validate options, connect the store, bind the listener, and spawn
    /// the component tasks.
    pub async fn start(options: ServerOptions, shutdown: CancellationToken) -> Result<Server> {
        let loopback = matches!(options.bind.as_str(), "localhost" | "127.0.0.1" | "::1");
        if options.auth == DEFAULT_AUTH && !loopback {
            return Err(HyperError::Config(
                "refusing non-loopback bind with the default auth token (set server.auth)"
                    .to_string(),
            ));
        }
        if options.restart && options.no_db {
            return Err(HyperError::Config("--restart requires a database".to_string()));
        }
        if options.forever && options.no_db {
            return Err(HyperError::Config("--forever requires a database".to_string()));
        }
        let store = if options.no_db {
            if options.max_retries > 0 {
                tracing::warn!("Retries are disabled without a database");
            }
            None
        } else {
            Some(TaskStore::connect(&options.database).await?)
        };
        let listener = TcpListener::bind((options.bind.as_str(), options.port)).await?;
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Server listening");
        let registry = Arc::new(RwLock::new(Registry::new()));
        let handle = tokio::spawn(run(
            options,
            store.clone(),
            registry.clone(),
            listener,
            shutdown,
        ));
        Ok(Server {
            addr,
            registry,
            store,
            handle,
        })
    }

    pub async fn join(self) -> Result<ServerSummary> {
        self.handle
            .await
            .map_err(|err| HyperError::Internal(err.to_string()))?
    }
}

async fn run(
    options: ServerOptions,
    store: Option<TaskStore>,
    registry: Arc<RwLock<Registry>>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<ServerSummary> {
    let (server_queue, outbound_tx, completed_rx) = ServerQueue::new(options.queuesize);
    let submitted = Arc::new(AtomicUsize::new(0));
    let submitter_done = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let receiver = Receiver {
        completed_rx,
        store: store.clone(),
        failure_sink: options.failure_sink.clone(),
        completed: completed.clone(),
        failed: failed.clone(),
    };
    let receiver_handle = tokio::spawn(receiver.run());

    let dispatcher_handle = tokio::spawn(dispatcher::serve(
        listener,
        DispatcherConfig {
            auth: options.auth.clone(),
            no_confirm: options.no_confirm,
        },
        server_queue.clone(),
        outbound_tx.downgrade(),
        registry.clone(),
        store.clone(),
        shutdown.clone(),
    ));

    let evictor_handle = tokio::spawn(dispatcher::run_evictor(
        registry.clone(),
        store.clone(),
        options.evict,
        options.wait,
        shutdown.clone(),
    ));

    if options.source.is_none() {
        submitter_done.store(true, Ordering::SeqCst);
    }
    let submitter_handle = options.source.clone().map(|source| {
        let sink = match &store {
            Some(store) => SubmitSink::Store(store.clone()),
            None => SubmitSink::Queue(outbound_tx.clone()),
        };
        let submitter = Submitter {
            source,
            sink,
            template: options.submit_template.as_deref().map(Template::new),
            tags: options.tags.clone(),
            bundlesize: options.bundlesize,
            bundlewait: options.bundlewait,
            submitted: submitted.clone(),
            done: submitter_done.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(submitter.run())
    });

    let scheduler_handle = store.clone().map(|store| {
        let scheduler = Scheduler {
            store,
            outbound: outbound_tx.clone(),
            bundlesize: options.bundlesize,
            attempts: options.max_retries + 1,
            eager: options.eager,
            forever: options.forever,
            restart: options.restart,
            wait: options.wait,
            evict: options.evict,
            submitter_done: options.source.is_some().then(|| submitter_done.clone()),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(scheduler.run())
    });
    // the scheduler (or in no-db mode the submitter) owns queue closure
    drop(outbound_tx);

    if let Some(handle) = submitter_handle {
        match handle.await {
            Ok(Ok(count)) => tracing::debug!(count, "Submission complete"),
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Submitter failed");
                shutdown.cancel();
            }
            Err(err) => tracing::error!(error = %err, "Submitter panicked"),
        }
    }

    match scheduler_handle {
        Some(handle) => match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Scheduler failed");
                shutdown.cancel();
            }
            Err(err) => tracing::error!(error = %err, "Scheduler panicked"),
        },
        // no-db mode: wait until every submitted task has come back
        None => loop {
            if shutdown.is_cancelled() {
                break;
            }
            if submitter_done.load(Ordering::SeqCst)
                && completed.load(Ordering::SeqCst) >= submitted.load(Ordering::SeqCst)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        },
    }

    wait_clients_drained(&registry, &store, options.evict, &shutdown).await;
    shutdown.cancel();
    let _ = dispatcher_handle.await;
    let _ = evictor_handle.await;
    drop(server_queue);
    if let Err(err) = receiver_handle
        .await
        .map_err(|err| HyperError::Internal(err.to_string()))?
    {
        tracing::error!(error = %err, "Receiver failed");
    }

    let summary = ServerSummary {
        submitted: submitted.load(Ordering::SeqCst),
        completed: completed.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
    };
    tracing::info!(
        submitted = summary.submitted,
        completed = summary.completed,
        failed = summary.failed,
        "Server shutdown"
    );
    Ok(summary)
}

/// Wait for registered clients to disconnect after drain; force-close any
/// remaining connections once the eviction period has passed.
async fn wait_clients_drained(
    registry: &Arc<RwLock<Registry>>,
    store: &Option<TaskStore>,
    evict: u64,
    shutdown: &CancellationToken,
) {
    let mut deadline = Instant::now() + Duration::from_secs(evict);
    let mut interrupted = false;
    while Instant::now() < deadline {
        if registry.read().await.is_empty() {
            return;
        }
        // an interrupt shortens the drain window but still allows in-flight
        // bundles to come back
        if shutdown.is_cancelled() && !interrupted {
            interrupted = true;
            deadline = deadline.min(Instant::now() + Duration::from_secs(evict.min(5)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let remaining = registry.write().await.drain_all();
    for registration in remaining {
        tracing::warn!(client_id = %registration.client_id, "Forcing client connection closed");
        registration.connection.cancel();
        if let Some(store) = store {
            let _ = store.client_disconnected(registration.client_id, true).await;
        }
    }
}
