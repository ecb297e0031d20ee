use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{HyperError, Result};
use crate::store::TaskStore;
use crate::task::Bundle;

/// Claims schedulable tasks from the database and publishes them onto the
/// bounded outbound queue. Dropping the queue sender on exit is the drain
/// signal for every connected client.
pub struct Scheduler {
    pub store: TaskStore,
    pub outbound: mpsc::Sender<Bundle>,
    pub bundlesize: usize,
    /// Total attempts allowed per task (`max_retries + 1`).
    pub attempts: u32,
    pub eager: bool,
    pub forever: bool,
    pub restart: bool,
    /// Seconds between database polls when idle.
    pub wait: u64,
    /// Seconds of persistent database failure tolerated before giving up.
    pub evict: u64,
    /// Set by the submitter when its input source is exhausted; absent
    /// submitter means scheduling starts against existing rows only.
    pub submitter_done: Option<Arc<AtomicBool>>,
    pub shutdown: CancellationToken,
}

/// Database failure state: first failure time and current backoff delay.
struct Backoff {
    since: Option<(Instant, u64)>,
}

impl Backoff {
    fn new() -> Self {
        Self { since: None }
    }

    fn clear(&mut self) {
        self.since = None;
    }

    /// Wait out the current delay; `false` once failures have persisted
    /// past the limit and the scheduler should give up.
    async fn wait(&mut self, limit: u64, err: &HyperError) -> bool {
        let (started, delay) = self.since.get_or_insert((Instant::now(), 1));
        if started.elapsed().as_secs() >= limit {
            tracing::error!(error = %err, "Database failure persisted, giving up");
            return false;
        }
        tracing::warn!(error = %err, retry_in = *delay, "Database error, backing off");
        tokio::time::sleep(Duration::from_secs(*delay)).await;
        *delay = (*delay * 2).min(30);
        true
    }
}

impl Scheduler {
    pub async fn run(self) -> Result<()> {
        tracing::debug!("Started (scheduler)");
        if self.forever {
            tracing::info!("Scheduler will run forever");
        }
        let existing = self.store.count().await?;
        if existing > 0 {
            tracing::warn!(count = existing, "Database holds previous tasks");
            let interrupted = self.store.count_interrupted().await?;
            if self.restart && interrupted > 0 {
                let reverted = self.store.revert_interrupted().await?;
                tracing::info!(count = reverted, "Reverted previously interrupted tasks");
            }
        }
        // hold off drain until work has been seen, unless restarting
        let mut started = self.restart;
        let mut backoff = Backoff::new();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let demand = self.outbound.capacity();
            if demand == 0 {
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            }
            let tasks = match self
                .store
                .claim_next(self.bundlesize * demand, self.eager)
                .await
            {
                Ok(tasks) => {
                    backoff.clear();
                    tasks
                }
                Err(err) => {
                    if backoff.wait(self.evict, &err).await {
                        continue;
                    }
                    return Err(err);
                }
            };
            if tasks.is_empty() {
                match self.idle_step(started).await {
                    Ok(IdleOutcome::Drain) => break,
                    Ok(IdleOutcome::Continue) => continue,
                    Ok(IdleOutcome::Sleep) => {}
                    Err(err) => {
                        if backoff.wait(self.evict, &err).await {
                            continue;
                        }
                        return Err(err);
                    }
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(self.wait)) => {}
                }
                continue;
            }
            started = true;
            for chunk in tasks.chunks(self.bundlesize) {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    sent = self.outbound.send(chunk.to_vec()) => {
                        if sent.is_err() {
                            tracing::debug!("Outbound queue closed");
                            return Ok(());
                        }
                    }
                }
                for task in chunk {
                    tracing::debug!(task_id = %task.id, "Scheduled task");
                }
            }
        }
        tracing::debug!("Done (scheduler)");
        Ok(())
    }

    /// Nothing claimable: insert retries, check for drain, or poll again.
    async fn idle_step(&self, started: bool) -> Result<IdleOutcome> {
        if self.attempts > 1 {
            let inserted = self
                .store
                .insert_retries(self.attempts, self.bundlesize * self.outbound.capacity().max(1))
                .await?;
            if inserted > 0 {
                return Ok(IdleOutcome::Continue);
            }
        }
        if !self.forever && started && self.submitter_finished() {
            let total = self.store.count().await?;
            if total > 0 && self.store.count_remaining().await? == 0 {
                return Ok(IdleOutcome::Drain);
            }
        }
        Ok(IdleOutcome::Sleep)
    }

    fn submitter_finished(&self) -> bool {
        self.submitter_done
            .as_ref()
            .map(|done| done.load(Ordering::SeqCst))
            .unwrap_or(true)
    }
}

enum IdleOutcome {
    Drain,
    Continue,
    Sleep,
}
