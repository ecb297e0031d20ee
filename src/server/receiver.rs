use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::store::TaskStore;
use crate::task::{Bundle, Task};

/// Destination for the original args of failed tasks.
#[derive(Debug, Clone)]
pub enum FailureSink {
    Stdout,
    File(PathBuf),
}

/// Collects completed task bundles returned by clients and records their
/// outcomes. Runs until the return channel closes.
pub struct Receiver {
    pub completed_rx: mpsc::UnboundedReceiver<Bundle>,
    pub store: Option<TaskStore>,
    pub failure_sink: Option<FailureSink>,
    pub completed: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
}

impl Receiver {
    pub async fn run(mut self) -> Result<()> {
        tracing::debug!("Started (receiver)");
        let mut failure_file = match &self.failure_sink {
            Some(FailureSink::File(path)) => Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
            _ => None,
        };
        while let Some(bundle) = self.completed_rx.recv().await {
            for mut task in bundle {
                fill_derived_timings(&mut task);
                if let Some(store) = &self.store {
                    match store.complete(&task).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // first write wins: an identical replay is a
                            // no-op, a conflicting one is an anomaly
                            let existing = store.fetch(task.id).await.ok().flatten();
                            match existing {
                                Some(row) if row.exit_status == task.exit_status => {
                                    tracing::debug!(task_id = %task.id, "Replayed completion ignored");
                                }
                                _ => {
                                    tracing::warn!(
                                        task_id = %task.id,
                                        client_id = ?task.client_id,
                                        "Conflicting completion for task, keeping first outcome"
                                    );
                                }
                            }
                            continue;
                        }
                        Err(err) => {
                            tracing::error!(task_id = %task.id, error = %err, "Failed to record completion");
                            continue;
                        }
                    }
                }
                self.completed.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(task_id = %task.id, "Completed task");
                if task.is_failed() {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        task_id = %task.id,
                        exit_status = task.exit_status.unwrap_or_default(),
                        "Non-zero exit status for task"
                    );
                    match (&self.failure_sink, &mut failure_file) {
                        (Some(FailureSink::Stdout), _) => println!("{}", task.args),
                        (_, Some(file)) => {
                            file.write_all(format!("{}\n", task.args).as_bytes()).await?;
                            file.flush().await?;
                        }
                        _ => {}
                    }
                }
            }
        }
        tracing::debug!(
            completed = self.completed.load(Ordering::SeqCst),
            failed = self.failed.load(Ordering::SeqCst),
            "Done (receiver)"
        );
        Ok(())
    }
}

/// Waited and duration are derived from the recorded times when the client
/// did not supply them.
fn fill_derived_timings(task: &mut Task) {
    if task.waited.is_none() {
        if let Some(start) = task.start_time {
            task.waited = Some((start - task.submit_time).num_seconds());
        }
    }
    if task.duration.is_none() {
        if let (Some(start), Some(end)) = (task.start_time, task.completion_time) {
            task.duration = Some((end - start).num_seconds());
        }
    }
}
