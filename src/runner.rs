//! Per-process orchestration.
//!
//! A [`Runner`] owns one process's ephemeral identity and wires the
//! heartbeat monitor and the dispatcher around shared store and broker
//! handles. True parallelism comes from running several runner processes
//! against the same database and consumer group; within one process
//! everything multiplexes on the async runtime.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::RunnerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DroverError, Result};
use crate::monitor::HeartbeatMonitor;
use crate::store::{HeartbeatStore, UnitStore};
use crate::unit::RunnerId;
use crate::worker::{DelegateExecutor, UnitWorker};

pub struct Runner {
    id: RunnerId,
    config: RunnerConfig,
    units: Arc<dyn UnitStore>,
    heartbeats: Arc<dyn HeartbeatStore>,
    broker: Arc<dyn Broker>,
}

impl Runner {
    /// Mint a fresh identity for this process and wire it to the shared
    /// store and broker.
    pub fn new(
        config: RunnerConfig,
        units: Arc<dyn UnitStore>,
        heartbeats: Arc<dyn HeartbeatStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            id: RunnerId::generate(),
            config,
            units,
            heartbeats,
            broker,
        }
    }

    pub fn id(&self) -> RunnerId {
        self.id
    }

    /// Register the heartbeat, then run the monitor and dispatcher loops
    /// until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let executor = DelegateExecutor::new(self.config.request_timeout())
            .map_err(|e| DroverError::Config(format!("http client: {e}")))?;

        let worker = UnitWorker::new(
            self.id,
            Arc::clone(&self.units),
            Arc::clone(&self.broker),
            executor,
            self.config.max_in_flight,
        );

        let monitor = HeartbeatMonitor::new(
            self.id,
            Arc::clone(&self.heartbeats),
            Arc::clone(&self.units),
            Arc::clone(&worker),
            self.config.heartbeat_interval(),
            self.config.expiry_threshold(),
        );
        monitor.register().await?;
        tracing::info!(runner_id = %self.id, "runner registered");

        let monitor_cancel = cancel.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor.run(monitor_cancel).await;
        });

        let dispatcher = Dispatcher::new(
            self.id,
            Arc::clone(&self.broker),
            Arc::clone(&self.units),
            worker,
        );
        dispatcher.run(cancel).await;

        let _ = monitor_handle.await;
        tracing::info!(runner_id = %self.id, "runner stopped");
        Ok(())
    }
}
