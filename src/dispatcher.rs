//! The runner's ingestion loop.
//!
//! Per inbound message: parse, insert (deduplicating on the message key),
//! commit the offset, then hand the unit to the worker pool. The offset
//! moves only after the unit row durably exists: a crash after the commit
//! leaves the unit in the store for the heartbeat sweep to recover, and a
//! crash before it only causes a redelivery that the duplicate check drops.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, InboundMessage};
use crate::store::{InsertOutcome, UnitStore};
use crate::unit::{ParseOutcome, RunnerId, parse_message};
use crate::worker::UnitWorker;

/// How long to back off after a consume error before pulling again.
const CONSUME_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    runner_id: RunnerId,
    broker: Arc<dyn Broker>,
    units: Arc<dyn UnitStore>,
    worker: Arc<UnitWorker>,
}

impl Dispatcher {
    pub fn new(
        runner_id: RunnerId,
        broker: Arc<dyn Broker>,
        units: Arc<dyn UnitStore>,
        worker: Arc<UnitWorker>,
    ) -> Self {
        Self {
            runner_id,
            broker,
            units,
            worker,
        }
    }

    /// Consume until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(runner_id = %self.runner_id, "dispatcher stopping");
                    break;
                }
                received = self.broker.next_message() => match received {
                    Ok(message) => self.ingest(message).await,
                    Err(e) => {
                        tracing::error!(error = %e, "consume failed, backing off");
                        tokio::time::sleep(CONSUME_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    async fn ingest(&self, message: InboundMessage) {
        let unit = match parse_message(message.key.as_deref(), &message.payload) {
            ParseOutcome::Parsed(unit) => unit,
            ParseOutcome::Malformed(reason) => {
                // Deterministic drop: redelivery would fail the same way,
                // so the offset moves past it.
                tracing::warn!(
                    partition = message.partition,
                    offset = message.offset,
                    reason = %reason,
                    "dropping malformed message"
                );
                self.commit(&message).await;
                return;
            }
        };

        match self.units.insert(&unit).await {
            Ok(InsertOutcome::Inserted) => {
                tracing::debug!(unit_id = %unit.id, "unit received");
                self.commit(&message).await;
                self.worker.spawn(unit).await;
            }
            Ok(InsertOutcome::Duplicate) => {
                tracing::debug!(unit_id = %unit.id, "duplicate delivery dropped");
                self.commit(&message).await;
            }
            Err(e) => {
                // No commit: the message will be redelivered and retried.
                tracing::error!(unit_id = %unit.id, error = %e, "failed to persist unit");
            }
        }
    }

    async fn commit(&self, message: &InboundMessage) {
        // A failed commit is survivable: the worst case is one redelivery,
        // which lands on the duplicate arm.
        if let Err(e) = self.broker.commit(message).await {
            tracing::warn!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "offset commit failed"
            );
        }
    }
}
