//! Background reconciliation of live instances against recorded activity

use crate::activity::ActivityTracker;
use crate::error::CoreError;
use crate::lifecycle::LifecycleManager;
use crate::registry::{Instance, Registry};
use crate::resolver::RoutingResolver;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one reconciliation sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Tagged instances seen in the runtime listing
    pub live: usize,
    /// Reclaimed because the tracker had no record of them
    pub untracked_reclaimed: Vec<String>,
    /// Reclaimed because they exceeded the idle threshold
    pub idle_reclaimed: Vec<String>,
    /// Records dropped for instances that no longer exist
    pub forgotten: Vec<String>,
    /// Per-instance teardown failures, retried next sweep
    pub failures: Vec<(String, String)>,
}

impl SweepReport {
    pub fn reclaimed(&self) -> usize {
        self.untracked_reclaimed.len() + self.idle_reclaimed.len()
    }
}

pub struct IdleReaper {
    registry: Arc<Registry>,
    tracker: Arc<ActivityTracker>,
    resolver: Arc<RoutingResolver>,
    lifecycle: Arc<LifecycleManager>,
    interval: Duration,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<Registry>,
        tracker: Arc<ActivityTracker>,
        resolver: Arc<RoutingResolver>,
        lifecycle: Arc<LifecycleManager>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            resolver,
            lifecycle,
            interval,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Run one sweep starting now
    pub async fn sweep(&self) -> Result<SweepReport, CoreError> {
        self.sweep_at(Instant::now()).await
    }

    /// Run one sweep that treats `now` as its start time.
    ///
    /// Only a failure to list instances aborts the sweep; teardown failures
    /// are recorded per instance and the sweep moves on.
    pub async fn sweep_at(&self, now: Instant) -> Result<SweepReport, CoreError> {
        let (current, tracked) = {
            let _barrier = self.lifecycle.launch_barrier().await;
            let current = self.registry.list_instances().await?;
            (current, self.tracker.snapshot())
        };

        let mut report = SweepReport {
            live: current.len(),
            ..Default::default()
        };

        for instance in current.iter().filter(|i| !tracked.contains_key(&i.id)) {
            info!(id = %instance.id, status = %instance.status, "Reclaiming untracked instance");
            if self.reclaim(instance, &mut report).await {
                report.untracked_reclaimed.push(instance.id.clone());
            }
        }

        for (id, record) in &tracked {
            if now.saturating_duration_since(record.last_seen) < self.idle_timeout {
                continue;
            }
            // A touch may have landed after the snapshot
            if !self.tracker.is_idle(id, now, self.idle_timeout) {
                debug!(id = %id, "Instance became active during sweep");
                continue;
            }

            let matching: Vec<&Instance> = current.iter().filter(|i| &i.id == id).collect();
            if matching.is_empty() {
                debug!(id = %id, "Dropping activity for vanished instance");
                self.lifecycle.forget(id);
                report.forgotten.push(id.clone());
                continue;
            }

            for instance in matching {
                info!(
                    id = %id,
                    idle_secs = now.saturating_duration_since(record.last_seen).as_secs(),
                    "Reclaiming idle instance"
                );
                if self.reclaim(instance, &mut report).await {
                    report.idle_reclaimed.push(id.clone());
                }
            }
        }

        let purged = self.resolver.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired route cache entries");
        }

        Ok(report)
    }

    async fn reclaim(&self, instance: &Instance, report: &mut SweepReport) -> bool {
        match self.lifecycle.stop_instance(instance).await {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %instance.id, error = %e, "Failed to reclaim instance");
                report.failures.push((instance.id.clone(), e.to_string()));
                false
            }
        }
    }

    /// Sweep on a fixed interval until `shutdown_rx` flips to true.
    /// The first sweep runs immediately.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Idle reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.reclaimed() > 0 || !report.failures.is_empty() => {
                            info!(
                                live = report.live,
                                untracked = report.untracked_reclaimed.len(),
                                idle = report.idle_reclaimed.len(),
                                failures = report.failures.len(),
                                "Sweep finished"
                            );
                        }
                        Ok(report) => {
                            debug!(live = report.live, tracked = self.tracker.len(), "Sweep finished, nothing to reclaim");
                        }
                        Err(e) => {
                            warn!(error = %e, "Sweep aborted, retrying next interval");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Idle reaper stopped");
    }

    /// Start [`run`](Self::run) on the tokio runtime
    pub fn spawn(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown_rx))
    }
}
