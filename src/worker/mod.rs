//! Unit execution engine.
//!
//! [`UnitWorker`] owns the claim-and-run sequence shared by the dispatcher
//! and the heartbeat monitor's reclaim path:
//!
//! 1. Mark the unit `InProgress` under this runner's identity
//! 2. Invoke the delegate endpoint ([`DelegateExecutor`])
//! 3. Record the terminal state and result
//! 4. Publish the terminal report if a response topic was requested
//!
//! Executions are fire-and-forget tasks bounded by a semaphore; a failure
//! inside one unit's task is logged and swallowed so it can never take down
//! a sibling execution or the process.

pub mod executor;

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::broker::Broker;
use crate::error::DroverError;
use crate::store::{UnitPatch, UnitStore};
use crate::unit::{RunnerId, TerminalReport, Unit, UnitStatus};

pub use executor::{DelegateExecutor, ExecutionOutcome};

pub struct UnitWorker {
    runner_id: RunnerId,
    units: Arc<dyn UnitStore>,
    broker: Arc<dyn Broker>,
    executor: DelegateExecutor,
    permits: Arc<Semaphore>,
}

impl UnitWorker {
    pub fn new(
        runner_id: RunnerId,
        units: Arc<dyn UnitStore>,
        broker: Arc<dyn Broker>,
        executor: DelegateExecutor,
        max_in_flight: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            runner_id,
            units,
            broker,
            executor,
            permits: Arc::new(Semaphore::new(max_in_flight)),
        })
    }

    /// Spawn a claim-and-run task for `unit`.
    ///
    /// Waits for a free execution slot first, so a saturated worker pool
    /// stalls the caller instead of growing an unbounded task set.
    pub async fn spawn(self: &Arc<Self>, unit: Unit) {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("worker semaphore is never closed");

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = worker.claim_and_run(&unit).await {
                // Outermost boundary: log and swallow. The unit stays
                // InProgress under this runner and is only recovered once
                // this runner's own heartbeat lapses.
                tracing::error!(unit_id = %unit.id, error = %e, "unit execution aborted");
            }
            drop(permit);
        });
    }

    async fn claim_and_run(&self, unit: &Unit) -> Result<(), DroverError> {
        self.units
            .update_fields(&unit.id, UnitPatch::claim(self.runner_id))
            .await?;

        let outcome = self.executor.execute(unit).await;
        let (status, result) = match outcome {
            ExecutionOutcome::Success(value) => (UnitStatus::Finished, value),
            ExecutionOutcome::Failure(reason) => {
                (UnitStatus::Failed, serde_json::Value::String(reason))
            }
        };

        self.units
            .update_fields(&unit.id, UnitPatch::terminal(status, result.clone()))
            .await?;

        tracing::info!(
            unit_id = %unit.id,
            runner_id = %self.runner_id,
            status = %status,
            "unit reached terminal state"
        );

        if let Some(topic) = &unit.response_topic {
            let report = TerminalReport { status, result };
            let payload = serde_json::to_vec(&report)?;
            self.broker.publish(topic, &unit.id, &payload).await?;
        }

        Ok(())
    }
}
