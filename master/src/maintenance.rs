//! Periodic maintenance: stale-server sweeps and the daily statistics reset.

use crate::config::SettingsHandle;
use crate::registry::{Registry, SweepOutcome};
use crate::stats::ClientStats;
use crate::utils::until_next_midnight;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub evicted: usize,
    pub alive: usize,
    pub fresh: usize,
    /// Past TTL but not probed because of a local socket failure.
    pub deferred: usize,
}

impl SweepSummary {
    fn record(&mut self, outcome: SweepOutcome) {
        match outcome {
            SweepOutcome::Evicted => self.evicted += 1,
            SweepOutcome::Alive => self.alive += 1,
            SweepOutcome::Fresh => self.fresh += 1,
            SweepOutcome::Deferred => self.deferred += 1,
        }
    }

    /// Servers that needed a probe this round.
    pub fn queried(&self) -> usize {
        self.evicted + self.alive
    }
}

pub struct Sweeper {
    registry: Arc<Registry>,
    settings: Arc<SettingsHandle>,
}

impl Sweeper {
    pub fn new(registry: Arc<Registry>, settings: Arc<SettingsHandle>) -> Self {
        Self { registry, settings }
    }

    /// Checks every registered endpoint once. Probes run concurrently.
    pub async fn sweep(&self) -> SweepSummary {
        let mut checks = JoinSet::new();
        for endpoint in self.registry.endpoints() {
            let registry = Arc::clone(&self.registry);
            checks.spawn(async move { registry.check_and_maybe_evict(endpoint).await });
        }

        let mut summary = SweepSummary::default();
        while let Some(result) = checks.join_next().await {
            match result {
                Ok(Some(outcome)) => summary.record(outcome),
                // Removed by another path since the endpoint list was taken.
                Ok(None) => {}
                Err(e) => warn!(target: "maintenance", "sweep task failed: {}", e),
            }
        }

        info!(
            target: "maintenance",
            "removed {} stale servers, queried {} servers, {} servers still fresh",
            summary.evicted,
            summary.queried(),
            summary.fresh
        );
        if summary.deferred > 0 {
            warn!(
                target: "maintenance",
                "{} servers left for the next sweep after local probe failures",
                summary.deferred
            );
        }
        summary
    }

    /// Sweeps on the configured interval until `shutdown` flips.
    ///
    /// The interval is re-read after every sweep, so a reload takes effect
    /// from the next tick.
    pub async fn run<F>(&self, mut shutdown: watch::Receiver<bool>, mut after_sweep: F)
    where
        F: FnMut(&SweepSummary) + Send,
    {
        let mut period = self.settings.current().maintenance_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.sweep().await;
                    after_sweep(&summary);

                    let current = self.settings.current().maintenance_interval();
                    if current != period {
                        debug!(target: "maintenance", "interval changed from {:?} to {:?}", period, current);
                        period = current;
                        ticker = interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(target: "maintenance", "sweeper stopped");
    }
}

/// Resets the daily client count at every UTC midnight until `shutdown` flips.
pub async fn run_daily_reset(stats: Arc<ClientStats>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let wait = until_next_midnight().max(Duration::from_secs(1));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                stats.reset_daily();
            }
            _ = shutdown.changed() => break,
        }
    }
}
