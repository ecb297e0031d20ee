//! Feedback-controlled client population. Every period the autoscaler
//! samples task pressure and the registered client count, and asks the
//! external launcher for more clients when warranted. Clients are never
//! terminated from here; attrition happens through the client idle timeout
//! or external scheduler eviction.

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{HyperError, Result};
use crate::server::registry::Registry;
use crate::store::TaskStore;

/// Completed-task window for the rolling average duration.
const DURATION_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Fixed,
    Dynamic,
}

impl FromStr for Policy {
    type Err = HyperError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_lowercase().as_str() {
            "fixed" => Ok(Policy::Fixed),
            "dynamic" => Ok(Policy::Dynamic),
            other => Err(HyperError::Config(format!(
                "unknown autoscale policy '{other}' (expected fixed or dynamic)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoscalerOptions {
    pub policy: Policy,
    pub factor: f64,
    pub period: u64,
    pub init: usize,
    pub min: usize,
    pub max: usize,
    /// Launch command prefix (e.g. `ssh node-1`, `mpirun -n 1`); empty
    /// launches the client command bare.
    pub launcher: String,
    /// Full client invocation handed to the launcher.
    pub client_command: String,
}

/// Instantaneous task metrics sampled each period.
#[derive(Debug, Clone, Copy)]
pub struct TaskMetrics {
    pub remaining: i64,
    pub avg_duration: Option<f64>,
    pub executors: usize,
}

/// Dimensionless scale-up signal: estimated time-to-completion over a
/// factor of the average task duration. `None` means pressure cannot be
/// estimated yet (no completed tasks, or no executors to measure by).
pub fn task_pressure(factor: f64, metrics: &TaskMetrics) -> Option<f64> {
    if metrics.remaining == 0 {
        return Some(0.0);
    }
    let avg_duration = metrics.avg_duration?;
    if metrics.executors == 0 || avg_duration <= 0.0 {
        return None;
    }
    let throughput = metrics.executors as f64 / avg_duration;
    let toc = metrics.remaining as f64 / throughput;
    Some(toc / (factor * avg_duration))
}

/// Number of launches for this cycle, honouring init/min/max bounds.
pub fn launches_needed(
    options: &AutoscalerOptions,
    active: usize,
    bootstrapped: bool,
    metrics: &TaskMetrics,
) -> usize {
    let headroom = options.max.saturating_sub(active);
    if !bootstrapped {
        return options.init.saturating_sub(active).min(headroom);
    }
    match options.policy {
        Policy::Fixed => {
            let target = options.init.max(options.min);
            target.saturating_sub(active)
        }
        Policy::Dynamic => {
            if active < options.min {
                return 1;
            }
            if headroom == 0 {
                return 0;
            }
            match task_pressure(options.factor, metrics) {
                Some(pressure) if pressure > 1.0 => 1,
                // no estimate yet: work exists but nothing measures throughput
                None if metrics.remaining > 0 => 1,
                _ => 0,
            }
        }
    }
}

pub struct Autoscaler {
    pub options: AutoscalerOptions,
    pub store: TaskStore,
    pub registry: Arc<RwLock<Registry>>,
    pub shutdown: CancellationToken,
}

impl Autoscaler {
    pub async fn run(self) {
        tracing::debug!(policy = ?self.options.policy, "Started (autoscaler)");
        let mut interval = tokio::time::interval(Duration::from_secs(self.options.period.max(1)));
        let mut bootstrapped = false;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.cycle(bootstrapped).await {
                tracing::error!(error = %err, "Autoscaler cycle skipped");
            }
            bootstrapped = true;
        }
        tracing::debug!("Done (autoscaler)");
    }

    async fn cycle(&self, bootstrapped: bool) -> Result<()> {
        let (active, executors) = {
            let registry = self.registry.read().await;
            (registry.active(), registry.total_executors())
        };
        let metrics = TaskMetrics {
            remaining: self.store.count_remaining().await?,
            avg_duration: self.store.avg_duration(DURATION_WINDOW).await?,
            executors,
        };
        let wanted = launches_needed(&self.options, active, bootstrapped, &metrics);
        tracing::debug!(
            active,
            remaining = metrics.remaining,
            pressure = ?task_pressure(self.options.factor, &metrics),
            wanted,
            "Autoscaler cycle"
        );
        for _ in 0..wanted {
            self.launch().await?;
        }
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        let command = if self.options.launcher.is_empty() {
            self.options.client_command.clone()
        } else {
            format!("{} {}", self.options.launcher, self.options.client_command)
        };
        tracing::info!(command = %command, "Launching client");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .spawn()
            .map_err(|err| HyperError::Launcher(err.to_string()))?;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::warn!(?status, "Launched client exited non-zero"),
                Err(err) => tracing::warn!(error = %err, "Could not reap launched client"),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(policy: Policy, init: usize, min: usize, max: usize) -> AutoscalerOptions {
        AutoscalerOptions {
            policy,
            factor: 1.0,
            period: 5,
            init,
            min,
            max,
            launcher: String::new(),
            client_command: "true".to_string(),
        }
    }

    fn metrics(remaining: i64, avg: Option<f64>, executors: usize) -> TaskMetrics {
        TaskMetrics {
            remaining,
            avg_duration: avg,
            executors,
        }
    }

    #[test]
    fn pressure_formula() {
        // 100 tasks remaining, 4 executors, 10s average: toc = 250s
        let pressure = task_pressure(1.0, &metrics(100, Some(10.0), 4)).unwrap();
        assert!((pressure - 25.0).abs() < 1e-9);
        assert_eq!(task_pressure(1.0, &metrics(0, None, 0)), Some(0.0));
        assert_eq!(task_pressure(1.0, &metrics(10, None, 4)), None);
        assert_eq!(task_pressure(1.0, &metrics(10, Some(5.0), 0)), None);
    }

    #[test]
    fn bootstrap_launches_init() {
        let opts = options(Policy::Dynamic, 3, 0, 4);
        assert_eq!(launches_needed(&opts, 0, false, &metrics(0, None, 0)), 3);
    }

    #[test]
    fn dynamic_respects_max() {
        let opts = options(Policy::Dynamic, 1, 0, 4);
        let busy = metrics(1000, Some(10.0), 4);
        assert_eq!(launches_needed(&opts, 4, true, &busy), 0);
        assert_eq!(launches_needed(&opts, 3, true, &busy), 1);
    }

    #[test]
    fn dynamic_scales_to_zero_when_idle() {
        let opts = options(Policy::Dynamic, 1, 0, 4);
        let idle = metrics(0, Some(10.0), 2);
        assert_eq!(launches_needed(&opts, 0, true, &idle), 0);
    }

    #[test]
    fn dynamic_holds_min() {
        let opts = options(Policy::Dynamic, 1, 2, 4);
        let idle = metrics(0, Some(10.0), 0);
        assert_eq!(launches_needed(&opts, 1, true, &idle), 1);
    }

    #[test]
    fn fixed_maintains_population() {
        let opts = options(Policy::Fixed, 3, 1, 4);
        assert_eq!(launches_needed(&opts, 1, true, &metrics(0, None, 0)), 2);
        assert_eq!(launches_needed(&opts, 3, true, &metrics(0, None, 0)), 0);
    }

    #[test]
    fn pressure_above_one_triggers_launch() {
        let opts = options(Policy::Dynamic, 1, 0, 4);
        // 8 tasks, 2 executors, 10s avg: toc = 40s, pressure = 4
        assert_eq!(launches_needed(&opts, 2, true, &metrics(8, Some(10.0), 2)), 1);
        // 1 task, 2 executors, 10s avg: toc = 5s, pressure = 0.5
        assert_eq!(launches_needed(&opts, 2, true, &metrics(1, Some(10.0), 2)), 0);
    }
}
