use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::TaskStore;
use crate::task::{Bundle, Task};
use crate::template::Template;

/// Where submitted task lines come from.
#[derive(Debug, Clone)]
pub enum TaskSource {
    Stdin,
    File(PathBuf),
    Lines(Vec<String>),
}

/// Where accumulated bundles go: the database, or (no-db mode) straight
/// onto the outbound queue.
pub enum SubmitSink {
    Store(TaskStore),
    Queue(mpsc::Sender<Bundle>),
}

/// Reads task lines until EOF, applies the optional submit-time template,
/// and emits bundles bounded by size or wait time. The final partial
/// bundle is always flushed before shutdown.
pub struct Submitter {
    pub source: TaskSource,
    pub sink: SubmitSink,
    pub template: Option<Template>,
    pub tags: BTreeMap<String, String>,
    pub bundlesize: usize,
    pub bundlewait: u64,
    pub submitted: Arc<AtomicUsize>,
    pub done: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
}

impl Submitter {
    pub async fn run(self) -> Result<usize> {
        tracing::debug!("Started (submitter)");
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &self.source {
            TaskSource::Stdin => Box::new(BufReader::new(tokio::io::stdin())),
            TaskSource::File(path) => {
                Box::new(BufReader::new(tokio::fs::File::open(path).await?))
            }
            TaskSource::Lines(lines) => Box::new(BufReader::new(std::io::Cursor::new(
                lines.join("\n").into_bytes(),
            ))),
        };
        let mut lines = reader.lines();
        let mut buffer: Vec<Task> = Vec::new();
        let bundlewait = Duration::from_secs(self.bundlewait);
        let mut last_flush = Instant::now();
        let result = loop {
            // an empty buffer has nothing to flush, so only the line read matters
            let deadline = if buffer.is_empty() {
                Instant::now() + Duration::from_secs(3600)
            } else {
                last_flush + bundlewait
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep_until(deadline) => {
                    self.flush(&mut buffer).await?;
                    last_flush = Instant::now();
                }
                line = lines.next_line() => match line? {
                    None => break Ok(()),
                    Some(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let mut task = Task::new(&line, &self.tags)?;
                        if let Some(template) = &self.template {
                            task.args = template.expand(&task.args)?;
                        }
                        tracing::trace!(task_id = %task.id, args = %task.args, "Loaded task");
                        buffer.push(task);
                        if buffer.len() >= self.bundlesize {
                            self.flush(&mut buffer).await?;
                            last_flush = Instant::now();
                        }
                    }
                },
            }
        };
        self.flush(&mut buffer).await?;
        self.done.store(true, Ordering::SeqCst);
        let total = self.submitted.load(Ordering::SeqCst);
        tracing::debug!(count = total, "Done (submitter)");
        result.map(|_| total)
    }

    async fn flush(&self, buffer: &mut Vec<Task>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let bundle = std::mem::take(buffer);
        let count = bundle.len();
        match &self.sink {
            SubmitSink::Store(store) => store.insert(&bundle).await?,
            SubmitSink::Queue(queue) => {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        tracing::warn!(count, "Interrupted, dropping unsent bundle");
                        return Ok(());
                    }
                    sent = queue.send(bundle) => {
                        if sent.is_err() {
                            tracing::warn!("Outbound queue closed before submit finished");
                            return Ok(());
                        }
                    }
                }
            }
        }
        self.submitted.fetch_add(count, Ordering::SeqCst);
        tracing::debug!(count, "Submitted tasks");
        Ok(())
    }
}
