//! Worker agent: registers with the server, pulls task bundles, fans them
//! out to a bounded executor pool, and returns completed bundles.

pub mod collector;
pub mod executor;
pub mod heartbeat;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{HyperError, Result};
use crate::protocol::{Ack, FrameCodec, Hello, Message};
use crate::task::HOSTNAME;
use crate::template::{Template, DEFAULT_TEMPLATE};

use executor::ExecutorContext;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Connecting,
    Ready,
    Running,
    Draining,
    Done,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub auth: String,
    pub num_tasks: usize,
    pub template: String,
    pub bundlesize: usize,
    pub bundlewait: u64,
    pub heartrate: u64,
    /// Seconds without a bundle before draining on our own.
    pub timeout: Option<u64>,
    pub task_timeout: Option<u64>,
    pub signalwait: u64,
    pub capture: bool,
    pub output_path: Option<PathBuf>,
    pub errors_path: Option<PathBuf>,
    /// Start-up delay in seconds; negative means uniform random in [0, |delay|).
    pub delay: f64,
    pub no_confirm: bool,
    pub cwd: Option<String>,
    pub exports: BTreeMap<String, String>,
}

impl ClientOptions {
    pub fn new(settings: &Settings) -> Self {
        Self {
            host: settings.server.bind.clone(),
            port: settings.server.port,
            auth: settings.server.auth.clone(),
            num_tasks: 1,
            template: DEFAULT_TEMPLATE.to_string(),
            bundlesize: settings.client.bundlesize,
            bundlewait: settings.client.bundlewait,
            heartrate: settings.client.heartrate,
            timeout: settings.client.timeout,
            task_timeout: settings.task.timeout,
            signalwait: settings.task.signalwait,
            capture: false,
            output_path: None,
            errors_path: None,
            delay: 0.0,
            no_confirm: false,
            cwd: settings.task.cwd.clone(),
            exports: settings.export.clone(),
        }
    }
}

/// Run the client until the server requests disconnect, the idle timeout
/// passes, or shutdown is signalled. `force` triggers immediate signal
/// escalation on all running task processes (SIGUSR1 semantics).
pub async fn run_client(
    options: ClientOptions,
    shutdown: CancellationToken,
    force: CancellationToken,
) -> Result<()> {
    delay_start(options.delay).await;
    let client_id = Uuid::new_v4();
    let mut phase = ClientPhase::Connecting;

    tracing::debug!(host = %options.host, port = options.port, phase = ?phase, "Connecting");
    let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
    let mut framed = Framed::new(stream, FrameCodec::new(&options.auth));
    framed
        .send(Message::Hello(Hello {
            client_id,
            client_host: HOSTNAME.clone(),
            num_tasks: options.num_tasks.max(1),
            token: options.auth.clone(),
        }))
        .await?;
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Message::Ack(_)))) => {}
        Ok(Some(Err(err))) => return Err(err),
        _ => {
            return Err(HyperError::Auth(
                "server closed connection during handshake (check auth token)".to_string(),
            ))
        }
    }
    phase = ClientPhase::Ready;
    tracing::info!(client_id = %client_id, num_tasks = options.num_tasks, phase = ?phase, "Connected");

    let (mut sink, mut frames) = framed.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(8);
    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            if sink.send(message).await.is_err() {
                tracing::debug!("Server connection closed while writing");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let heartbeat_stop = CancellationToken::new();
    let heartbeat_handle = tokio::spawn(heartbeat::run_heartbeat(
        client_id,
        outgoing_tx.clone(),
        options.heartrate,
        heartbeat_stop.clone(),
    ));

    let num_tasks = options.num_tasks.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(num_tasks);
    let inbound_rx = Arc::new(Mutex::new(inbound_rx));
    let (finished_tx, finished_rx) = mpsc::channel(options.bundlesize.max(1));
    let collector_handle = tokio::spawn(collector::run_collector(
        finished_rx,
        outgoing_tx.clone(),
        options.bundlesize,
        options.bundlewait,
    ));

    let cwd = match &options.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir()?.to_string_lossy().into_owned(),
    };
    let context = Arc::new(ExecutorContext {
        client_id,
        template: Template::new(&options.template),
        cwd,
        capture: options.capture,
        capture_dir: lib_dir().join("task"),
        output_path: options.output_path.clone(),
        errors_path: options.errors_path.clone(),
        timeout: options.task_timeout,
        signalwait: options.signalwait,
        exports: options.exports.clone(),
    });
    let executors: Vec<_> = (1..=num_tasks)
        .map(|id| {
            tokio::spawn(executor::run_executor(
                id,
                context.clone(),
                inbound_rx.clone(),
                finished_tx.clone(),
                force.clone(),
            ))
        })
        .collect();
    drop(finished_tx);

    // pull loop: the bounded inbound channel enforces the one-bundle-ahead
    // pull policy; fan-out blocks while every executor is busy
    let idle = options.timeout.map(Duration::from_secs);
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Interrupt received, draining");
                break;
            }
            frame = async {
                match idle {
                    Some(limit) => tokio::time::timeout(limit, frames.next()).await,
                    None => Ok(frames.next().await),
                }
            } => match frame {
                Err(_) => {
                    tracing::info!(timeout = ?idle, "No bundle within timeout, draining");
                    break;
                }
                Ok(frame) => frame,
            },
        };
        match frame {
            Some(Ok(Message::BundleOut(bundle))) => {
                if phase == ClientPhase::Ready {
                    phase = ClientPhase::Running;
                }
                tracing::debug!(count = bundle.len(), phase = ?phase, "Received bundle");
                if !options.no_confirm {
                    let ack = Ack {
                        client_id,
                        client_host: HOSTNAME.clone(),
                        task_ids: bundle.iter().map(|task| task.id).collect(),
                    };
                    if outgoing_tx.send(Message::Ack(ack)).await.is_err() {
                        break;
                    }
                }
                for task in bundle {
                    if inbound_tx.send(task).await.is_err() {
                        tracing::error!("Executor pool gone");
                        break;
                    }
                }
            }
            Some(Ok(Message::Disconnect)) => {
                tracing::debug!("Disconnect received, draining");
                break;
            }
            Some(Ok(other)) => {
                tracing::warn!(message = ?other.tag(), "Unexpected frame from server");
            }
            Some(Err(err)) => {
                tracing::error!(error = %err, "Connection error, draining");
                break;
            }
            None => {
                tracing::warn!("Server closed connection, draining");
                break;
            }
        }
    }

    // drain: executors finish in-flight tasks, collector flushes the final
    // bundle, heartbeat sends its finished notice, writer closes the socket
    phase = ClientPhase::Draining;
    tracing::debug!(phase = ?phase, "Draining");
    drop(inbound_tx);
    for handle in executors {
        let _ = handle.await;
    }
    let _ = collector_handle.await;
    heartbeat_stop.cancel();
    let _ = heartbeat_handle.await;
    drop(outgoing_tx);
    let _ = writer.await;
    phase = ClientPhase::Done;
    tracing::info!(client_id = %client_id, phase = ?phase, "Done");
    Ok(())
}

/// Wait a constant period, or a uniform random interval for negative
/// values, before connecting (fleet ramp-up).
async fn delay_start(delay: f64) {
    if delay == 0.0 {
        return;
    }
    let seconds = if delay > 0.0 {
        delay
    } else {
        rand::thread_rng().gen_range(0.0..-delay)
    };
    tracing::debug!(seconds, "Delaying start");
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
}

/// Local state directory for captured task streams.
pub fn lib_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".hypershell").join("lib")
}
