//! Background timers.
//!
//! Each [`ScheduledTask`] runs its callback on a fixed period until stopped.
//! A callback that fails is logged and the timer keeps going; a callback that
//! runs past its period is abandoned for that tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::manager::PeeringManager;
use crate::monitor::HealthMonitor;
use crate::plasticity::HomeostaticOptions;

pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub struct ScheduledTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Start calling `tick` every `period`. The first call happens one period
    /// after spawning.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(task = name, period_ms = period.as_millis() as u64, "timer started");

            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = interval.tick() => {
                        match tokio::time::timeout(period, tick()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(task = name, error = %e, "timer callback failed"),
                            Err(_) => warn!(task = name, "timer callback exceeded its interval"),
                        }
                    }
                }
            }
            debug!(task = name, "timer stopped");
        });

        Self { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the timer and wait for it to exit
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "timer task ended abnormally");
        }
    }
}

async fn validate_plasticity(manager: Arc<PeeringManager>, cancel: CancelToken) -> TaskResult {
    manager.prune_detached();
    let peers = manager.coordinator().tracked_peers();
    let validation = manager
        .coordinator()
        .validate_coherence(&peers, &cancel)
        .await?;
    manager.mirror_coherence(&validation);
    if !validation.is_coherent() {
        warn!(
            violations = validation.violations.len(),
            actions = validation.recommended_actions.len(),
            "coherence violations detected"
        );
    }
    Ok(())
}

async fn rebalance(manager: Arc<PeeringManager>, cancel: CancelToken) -> TaskResult {
    let peers = manager.active_peers();
    let options = HomeostaticOptions::from(&manager.config().plasticity);
    manager
        .coordinator()
        .apply_homeostatic_scaling(&peers, options, &cancel)
        .await?;
    Ok(())
}

/// Health, metrics, plasticity validation and homeostatic timers for one
/// manager.
pub struct BackgroundTasks {
    tasks: Vec<ScheduledTask>,
    cancel: CancelToken,
}

impl BackgroundTasks {
    pub fn start(manager: Arc<PeeringManager>, monitor: Arc<HealthMonitor>) -> Self {
        let schedule = manager.config().schedule.clone();
        let cancel = CancelToken::new();
        let mut tasks = Vec::with_capacity(4);

        tasks.push(ScheduledTask::spawn("health_check", schedule.health_check(), move || {
            let monitor = monitor.clone();
            async move {
                monitor.check().await;
                Ok(())
            }
        }));

        let m = manager.clone();
        tasks.push(ScheduledTask::spawn("metrics", schedule.metrics(), move || {
            let manager = m.clone();
            async move {
                let metrics = manager.coordinator().monitor_metrics();
                info!(
                    peers = metrics.tracked_peers,
                    ltp = metrics.ltp_events,
                    ltd = metrics.ltd_events,
                    stdp_violations = metrics.stdp_violations,
                    avg_strength = metrics.average_strength,
                    avg_coherence = metrics.average_coherence,
                    compliance = metrics.biological_timing_compliance,
                    "plasticity metrics"
                );
                Ok(())
            }
        }));

        let m = manager.clone();
        let c = cancel.clone();
        tasks.push(ScheduledTask::spawn(
            "plasticity_validation",
            schedule.plasticity_validation(),
            move || validate_plasticity(m.clone(), c.clone()),
        ));

        let c = cancel.clone();
        tasks.push(ScheduledTask::spawn("homeostatic", schedule.homeostatic(), move || {
            rebalance(manager.clone(), c.clone())
        }));

        info!(timers = tasks.len(), "background tasks started");
        Self { tasks, cancel }
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Cancel in-flight work and stop every timer
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.stop().await;
        }
        info!("background tasks stopped");
    }
}
