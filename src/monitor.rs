//! Liveness and failover.
//!
//! Every runner renews its own heartbeat once per interval and sweeps the
//! fleet for peers whose heartbeat has aged past
//! `interval * threshold_multiplier`. A dead peer's unfinished units are
//! reclaimed one at a time under the store's lease and re-executed locally:
//! their offsets were committed long ago, so the log will never redeliver
//! them. The sweep instant is jittered inside the interval to spread
//! contention on the shared store across the fleet.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::DroverError;
use crate::store::{Heartbeat, HeartbeatStore, ReclaimOutcome, UnitStore};
use crate::unit::{RunnerId, UnitStatus};
use crate::worker::UnitWorker;

/// Picks how far into the interval this cycle's touch-and-sweep happens.
fn sweep_jitter(interval: Duration) -> Duration {
    let max_ms = interval.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(1..=max_ms))
}

pub struct HeartbeatMonitor {
    runner_id: RunnerId,
    heartbeats: Arc<dyn HeartbeatStore>,
    units: Arc<dyn UnitStore>,
    worker: Arc<UnitWorker>,
    interval: Duration,
    expiry_threshold: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        runner_id: RunnerId,
        heartbeats: Arc<dyn HeartbeatStore>,
        units: Arc<dyn UnitStore>,
        worker: Arc<UnitWorker>,
        interval: Duration,
        expiry_threshold: Duration,
    ) -> Self {
        Self {
            runner_id,
            heartbeats,
            units,
            worker,
            interval,
            expiry_threshold,
        }
    }

    /// Create this runner's heartbeat row. Called once before the loop.
    pub async fn register(&self) -> Result<(), DroverError> {
        self.heartbeats.create(self.runner_id).await?;
        Ok(())
    }

    /// Touch-and-sweep forever, one cycle per interval.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let lead = sweep_jitter(self.interval);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(lead) => {}
            }

            if let Err(e) = self.heartbeats.touch(self.runner_id).await {
                tracing::error!(runner_id = %self.runner_id, error = %e, "heartbeat touch failed");
            }
            if let Err(e) = self.sweep().await {
                tracing::error!(runner_id = %self.runner_id, error = %e, "sweep failed");
            }

            // Sleep out the rest of the interval so the cycle period stays
            // constant while the sweep instant stays randomized.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval.saturating_sub(lead)) => {}
            }
        }
        tracing::info!(runner_id = %self.runner_id, "heartbeat monitor stopping");
    }

    /// Reclaim and re-dispatch every unfinished unit of every expired
    /// runner, then delete the expired heartbeats.
    async fn sweep(&self) -> Result<(), DroverError> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.expiry_threshold.as_millis() as i64);
        let expired = self.heartbeats.list_expired(cutoff).await?;

        for heartbeat in expired {
            self.reclaim_from(&heartbeat).await?;
            self.heartbeats.delete(&[heartbeat.id]).await?;
        }
        Ok(())
    }

    async fn reclaim_from(&self, heartbeat: &Heartbeat) -> Result<(), DroverError> {
        tracing::info!(
            dead_runner = %heartbeat.id,
            last_heartbeat = %heartbeat.last_heartbeat,
            "heartbeat expired, reclaiming its units"
        );

        let orphans = self.units.list_owned_unfinished(heartbeat.id).await?;
        for unit in orphans {
            match self.units.reclaim_to_unowned(&unit.id, heartbeat.id).await? {
                ReclaimOutcome::Reclaimed => {
                    tracing::info!(
                        unit_id = %unit.id,
                        dead_runner = %heartbeat.id,
                        new_runner = %self.runner_id,
                        "unit reclaimed"
                    );
                    let mut unit = unit;
                    unit.runner_id = None;
                    unit.status = UnitStatus::Received;
                    self.worker.spawn(unit).await;
                }
                ReclaimOutcome::Skipped => {
                    tracing::debug!(unit_id = %unit.id, "lost reclaim race, skipping");
                }
            }
        }
        Ok(())
    }
}
