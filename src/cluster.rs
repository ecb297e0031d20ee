//! One-shot cluster runs: a server plus a managed client population,
//! either in-process (local) or launched externally (ssh, mpirun, or any
//! custom launcher), optionally under autoscaler control.

use rand::RngCore;
use tokio_util::sync::CancellationToken;

use crate::autoscale::{Autoscaler, AutoscalerOptions};
use crate::client::{run_client, ClientOptions};
use crate::error::Result;
use crate::server::{Server, ServerOptions};
use crate::task::HOSTNAME;

/// Fresh random authentication token for a managed cluster.
pub fn generate_auth() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Run a server with `num_clients` in-process clients until all work is
/// complete. Returns the process exit code: non-zero when tasks ultimately
/// failed (no successful attempt).
pub async fn run_local_cluster(
    mut server_options: ServerOptions,
    mut client_options: ClientOptions,
    num_clients: usize,
    shutdown: CancellationToken,
    force: CancellationToken,
) -> Result<i32> {
    let auth = generate_auth();
    server_options.auth = auth.clone();
    client_options.auth = auth;
    let server = Server::start(server_options, shutdown.clone()).await?;
    client_options.host = "localhost".to_string();
    client_options.port = server.addr.port();

    let clients: Vec<_> = (0..num_clients.max(1))
        .map(|_| {
            let options = client_options.clone();
            let shutdown = shutdown.clone();
            let force = force.clone();
            tokio::spawn(async move {
                if let Err(err) = run_client(options, shutdown, force).await {
                    tracing::error!(error = %err, "Client failed");
                }
            })
        })
        .collect();

    let store = server.store.clone();
    let summary = server.join().await?;
    for client in clients {
        let _ = client.await;
    }
    exit_code(&store, summary.failed).await
}

/// Run a server bound to all interfaces with clients launched through an
/// external command, optionally autoscaling the population.
pub async fn run_remote_cluster(
    mut server_options: ServerOptions,
    client_options: ClientOptions,
    launchers: Vec<String>,
    autoscale: Option<AutoscalerOptions>,
    shutdown: CancellationToken,
) -> Result<i32> {
    if server_options.auth == crate::config::DEFAULT_AUTH {
        server_options.auth = generate_auth();
    }
    server_options.bind = "0.0.0.0".to_string();
    let server = Server::start(server_options.clone(), shutdown.clone()).await?;
    let client_command = client_argv(&client_options, &server_options.auth, server.addr.port());

    let autoscaler_handle = match autoscale {
        Some(mut options) => {
            let store = server.store.clone().ok_or_else(|| {
                crate::error::HyperError::Config(
                    "autoscaling requires a database".to_string(),
                )
            })?;
            options.launcher = launchers.into_iter().next().unwrap_or_default();
            options.client_command = client_command;
            let autoscaler = Autoscaler {
                options,
                store,
                registry: server.registry.clone(),
                shutdown: shutdown.clone(),
            };
            Some(tokio::spawn(autoscaler.run()))
        }
        None => {
            for launcher in &launchers {
                let command = if launcher.is_empty() {
                    client_command.clone()
                } else {
                    format!("{launcher} {client_command}")
                };
                tracing::info!(command = %command, "Launching clients");
                let mut child = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .spawn()
                    .map_err(|err| crate::error::HyperError::Launcher(err.to_string()))?;
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            None
        }
    };

    let store = server.store.clone();
    let summary = server.join().await?;
    shutdown.cancel();
    if let Some(handle) = autoscaler_handle {
        let _ = handle.await;
    }
    exit_code(&store, summary.failed).await
}

/// Client argv handed to the launcher: mirrors the `client` subcommand.
fn client_argv(options: &ClientOptions, auth: &str, port: u16) -> String {
    let exe = std::env::current_exe()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "hypershell".to_string());
    let mut argv = format!(
        "{exe} client -H {} -p {port} -k {auth} -N {} -b {} -w {} -t '{}'",
        HOSTNAME.as_str(),
        options.num_tasks.max(1),
        options.bundlesize,
        options.bundlewait,
        options.template,
    );
    if options.capture {
        argv.push_str(" --capture");
    }
    if options.no_confirm {
        argv.push_str(" --no-confirm");
    }
    if options.delay != 0.0 {
        argv.push_str(&format!(" -d {}", options.delay));
    }
    if let Some(timeout) = options.timeout {
        argv.push_str(&format!(" -T {timeout}"));
    }
    if let Some(timeout) = options.task_timeout {
        argv.push_str(&format!(" -W {timeout}"));
    }
    argv
}

/// Zero when every task ultimately succeeded; tasks whose final attempt
/// failed make the cluster exit non-zero.
async fn exit_code(store: &Option<crate::store::TaskStore>, failed: usize) -> Result<i32> {
    match store {
        Some(store) => Ok(if store.count_failed_final().await? > 0 { 1 } else { 0 }),
        None => Ok(if failed > 0 { 1 } else { 0 }),
    }
}
