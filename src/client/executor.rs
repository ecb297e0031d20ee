use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use uuid::Uuid;

use crate::task::{Task, EXIT_STATUS_TEMPLATE_ERROR, EXIT_STATUS_UNKILLABLE, HOSTNAME};
use crate::template::Template;

/// Shared executor configuration for one client.
#[derive(Debug)]
pub struct ExecutorContext {
    pub client_id: Uuid,
    pub template: Template,
    pub cwd: String,
    pub capture: bool,
    /// Directory for per-task stream files under capture mode.
    pub capture_dir: PathBuf,
    pub output_path: Option<PathBuf>,
    pub errors_path: Option<PathBuf>,
    /// Task walltime limit in seconds.
    pub timeout: Option<u64>,
    /// Seconds between INT, TERM and KILL during escalation.
    pub signalwait: u64,
    /// Operator-configured exports injected into every task environment.
    pub exports: BTreeMap<String, String>,
}

/// Pull tasks off the local queue and run one shell process per task.
/// Exits when the queue closes, or when a task process ignores SIGKILL.
pub async fn run_executor(
    id: usize,
    context: Arc<ExecutorContext>,
    inbound: Arc<Mutex<mpsc::Receiver<Task>>>,
    finished: mpsc::Sender<Task>,
    force: CancellationToken,
) {
    tracing::debug!(executor = id, "Started (executor)");
    loop {
        let task = { inbound.lock().await.recv().await };
        let Some(mut task) = task else {
            break;
        };
        let alive = execute(id, &context, &mut task, &force).await;
        if finished.send(task).await.is_err() {
            tracing::warn!(executor = id, "Collector gone, dropping task outcome");
            break;
        }
        if !alive {
            tracing::error!(executor = id, "Shutting down executor after unkillable task");
            return;
        }
    }
    tracing::debug!(executor = id, "Done (executor)");
}

/// Run one task to completion. Returns false when the executor itself must
/// shut down because the task process survived SIGKILL.
async fn execute(
    id: usize,
    context: &ExecutorContext,
    task: &mut Task,
    force: &CancellationToken,
) -> bool {
    task.client_id = Some(context.client_id);
    task.client_host = Some(HOSTNAME.clone());

    let template = context.template.clone();
    let args = task.args.clone();
    let expanded = tokio::task::spawn_blocking(move || template.expand(&args)).await;
    let command = match expanded {
        Ok(Ok(command)) => command,
        Ok(Err(err)) => {
            tracing::error!(task_id = %task.id, error = %err, "Template expansion failed");
            let now = Utc::now();
            task.start_time = Some(now);
            task.completion_time = Some(now);
            task.exit_status = Some(EXIT_STATUS_TEMPLATE_ERROR);
            return true;
        }
        Err(err) => {
            tracing::error!(task_id = %task.id, error = %err, "Template expansion panicked");
            task.exit_status = Some(EXIT_STATUS_TEMPLATE_ERROR);
            return true;
        }
    };
    task.command = Some(command.clone());
    let start = Utc::now();
    task.start_time = Some(start);
    task.waited = Some((start - task.submit_time).num_seconds());
    if context.capture {
        task.outpath = Some(
            context
                .capture_dir
                .join(format!("{}.out", task.id))
                .to_string_lossy()
                .into_owned(),
        );
        task.errpath = Some(
            context
                .capture_dir
                .join(format!("{}.err", task.id))
                .to_string_lossy()
                .into_owned(),
        );
    }

    let mut env = task.env(&context.cwd);
    env.extend(context.exports.clone());
    let (stdout, stderr) = match open_streams(context, task) {
        Ok(streams) => streams,
        Err(err) => {
            tracing::error!(task_id = %task.id, error = %err, "Could not open task streams");
            task.completion_time = Some(Utc::now());
            task.exit_status = Some(EXIT_STATUS_TEMPLATE_ERROR);
            return true;
        }
    };

    let child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(&context.cwd)
        .envs(&env)
        .stdout(stdout)
        .stderr(stderr)
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(task_id = %task.id, error = %err, "Could not spawn task process");
            task.completion_time = Some(Utc::now());
            task.exit_status = Some(127);
            return true;
        }
    };
    tracing::info!(task_id = %task.id, executor = id, command = %command, "Running task");

    let walltime = async {
        match context.timeout {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => futures::future::pending().await,
        }
    };
    // resolve the wait first so the child is free to signal afterwards
    let exited = {
        let wait = child.wait();
        tokio::pin!(wait);
        tokio::select! {
            status = &mut wait => Some(status.ok()),
            _ = walltime => {
                tracing::warn!(task_id = %task.id, "Task exceeded walltime limit");
                None
            }
            _ = force.cancelled() => {
                tracing::warn!(task_id = %task.id, "Forced shutdown requested");
                None
            }
        }
    };
    let status = match exited {
        Some(status) => status,
        None => escalate(&mut child, context.signalwait).await,
    };
    let completion = Utc::now();
    task.completion_time = Some(completion);
    task.duration = Some((completion - start).num_seconds());
    match status {
        Some(status) => {
            // a signal death is recorded as the negated signal number
            task.exit_status = Some(
                status
                    .code()
                    .unwrap_or_else(|| -status.signal().unwrap_or(1)),
            );
            tracing::debug!(
                task_id = %task.id,
                exit_status = task.exit_status.unwrap_or_default(),
                "Completed task"
            );
            true
        }
        None => {
            tracing::error!(task_id = %task.id, "Process ignored SIGKILL");
            task.exit_status = Some(EXIT_STATUS_UNKILLABLE);
            false
        }
    }
}

/// INT, TERM, KILL with `signalwait` seconds between attempts. Returns the
/// exit status, or `None` if the process survived SIGKILL.
async fn escalate(child: &mut Child, signalwait: u64) -> Option<std::process::ExitStatus> {
    let wait = Duration::from_secs(signalwait.max(1));
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL] {
        match child.id() {
            Some(pid) => {
                tracing::debug!(signal = %sig, pid, "Signalling task process");
                let _ = signal::kill(Pid::from_raw(pid as i32), sig);
            }
            None => return child.wait().await.ok(),
        }
        if let Ok(status) = tokio::time::timeout(wait, child.wait()).await {
            return status.ok();
        }
    }
    None
}

fn open_streams(context: &ExecutorContext, task: &Task) -> std::io::Result<(Stdio, Stdio)> {
    if context.capture {
        std::fs::create_dir_all(&context.capture_dir)?;
        let out = std::fs::File::create(task.outpath.as_deref().unwrap_or_default())?;
        let err = std::fs::File::create(task.errpath.as_deref().unwrap_or_default())?;
        return Ok((Stdio::from(out), Stdio::from(err)));
    }
    let out = match &context.output_path {
        Some(path) => Stdio::from(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        ),
        None => Stdio::inherit(),
    };
    let err = match &context.errors_path {
        Some(path) => Stdio::from(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        ),
        None => Stdio::inherit(),
    };
    Ok((out, err))
}
