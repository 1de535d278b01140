//! Persistence seams for units and heartbeats.
//!
//! Both traits are implemented twice: against Postgres for production and
//! in memory for tests and local development. Every mutating operation is
//! single-row; the reclaim path is the storage layer's atomic claim-or-skip
//! primitive that serializes racing sweeps.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::unit::{RunnerId, Unit, UnitStatus};

pub use memory::{MemoryHeartbeatStore, MemoryUnitStore};
pub use postgres::{PgHeartbeatStore, PgUnitStore, connect, run_migrations};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Backend(String),

    #[error("corrupt row for unit {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Outcome of an insert attempt, keyed by the unit's dedup id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The id already exists. Stored state is untouched; the caller drops
    /// the redelivered message.
    Duplicate,
}

/// Outcome of an atomic reclaim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// This caller won the lease: the unit is back to unowned `Received`.
    Reclaimed,
    /// Another sweeper got there first, the owner changed, or the unit
    /// reached a terminal state. Nothing was modified.
    Skipped,
}

/// Partial update applied to a unit row. `None` fields are left unchanged;
/// `updated` is always bumped.
#[derive(Debug, Clone, Default)]
pub struct UnitPatch {
    pub status: Option<UnitStatus>,
    pub runner_id: Option<RunnerId>,
    pub result: Option<serde_json::Value>,
}

impl UnitPatch {
    pub fn claim(runner_id: RunnerId) -> Self {
        Self {
            status: Some(UnitStatus::InProgress),
            runner_id: Some(runner_id),
            result: None,
        }
    }

    pub fn terminal(status: UnitStatus, result: serde_json::Value) -> Self {
        Self {
            status: Some(status),
            runner_id: None,
            result: Some(result),
        }
    }
}

#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Insert a freshly received unit, detecting duplicate ids.
    async fn insert(&self, unit: &Unit) -> Result<InsertOutcome, StoreError>;

    /// Unconditional field patch; used for every status transition.
    async fn update_fields(&self, id: &str, patch: UnitPatch) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Unit>, StoreError>;

    /// Units with `status` in {Received, InProgress} owned by `runner_id`.
    async fn list_owned_unfinished(&self, runner_id: RunnerId) -> Result<Vec<Unit>, StoreError>;

    /// Atomically clear ownership and force `Received`, but only while the
    /// unit is still unfinished and still owned by `previous_owner`.
    /// Exactly one of two racing callers wins; the loser sees `Skipped`.
    async fn reclaim_to_unowned(
        &self,
        id: &str,
        previous_owner: RunnerId,
    ) -> Result<ReclaimOutcome, StoreError>;
}

/// Liveness record for one runner process.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub id: RunnerId,
    pub last_heartbeat: DateTime<Utc>,
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Create this runner's row. Called once at process start.
    async fn create(&self, id: RunnerId) -> Result<(), StoreError>;

    /// Advance `last_heartbeat` to now.
    async fn touch(&self, id: RunnerId) -> Result<(), StoreError>;

    /// All rows with `last_heartbeat <= cutoff`.
    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Heartbeat>, StoreError>;

    /// Remove the rows of runners declared dead.
    async fn delete(&self, ids: &[RunnerId]) -> Result<(), StoreError>;
}
