//! In-memory store implementations.
//!
//! Back the integration test harness, where several in-process runners
//! share one store the way production runners share one database. The
//! reclaim path keeps the same winner-takes-one semantics as the Postgres
//! lease: the check and the reset happen under a single mutex guard.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::unit::{RunnerId, Unit, UnitStatus};

use super::{
    Heartbeat, HeartbeatStore, InsertOutcome, ReclaimOutcome, StoreError, UnitPatch, UnitStore,
};

#[derive(Default, Clone)]
pub struct MemoryUnitStore {
    units: Arc<Mutex<HashMap<String, Unit>>>,
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored unit, for test assertions.
    pub async fn all(&self) -> Vec<Unit> {
        self.units.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl UnitStore for MemoryUnitStore {
    async fn insert(&self, unit: &Unit) -> Result<InsertOutcome, StoreError> {
        let mut units = self.units.lock().await;
        if units.contains_key(&unit.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        units.insert(unit.id.clone(), unit.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update_fields(&self, id: &str, patch: UnitPatch) -> Result<(), StoreError> {
        let mut units = self.units.lock().await;
        let Some(unit) = units.get_mut(id) else {
            return Err(StoreError::Backend(format!("no unit with id {id}")));
        };
        if let Some(status) = patch.status {
            unit.status = status;
        }
        if let Some(runner_id) = patch.runner_id {
            unit.runner_id = Some(runner_id);
        }
        if let Some(result) = patch.result {
            unit.result = Some(result);
        }
        unit.updated = Utc::now();
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Unit>, StoreError> {
        Ok(self.units.lock().await.get(id).cloned())
    }

    async fn list_owned_unfinished(&self, runner_id: RunnerId) -> Result<Vec<Unit>, StoreError> {
        let units = self.units.lock().await;
        Ok(units
            .values()
            .filter(|u| u.runner_id == Some(runner_id) && !u.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn reclaim_to_unowned(
        &self,
        id: &str,
        previous_owner: RunnerId,
    ) -> Result<ReclaimOutcome, StoreError> {
        let mut units = self.units.lock().await;
        let Some(unit) = units.get_mut(id) else {
            return Ok(ReclaimOutcome::Skipped);
        };
        if unit.runner_id != Some(previous_owner) || unit.status.is_terminal() {
            return Ok(ReclaimOutcome::Skipped);
        }
        unit.runner_id = None;
        unit.status = UnitStatus::Received;
        unit.updated = Utc::now();
        Ok(ReclaimOutcome::Reclaimed)
    }
}

#[derive(Default, Clone)]
pub struct MemoryHeartbeatStore {
    rows: Arc<Mutex<HashMap<RunnerId, DateTime<Utc>>>>,
}

impl MemoryHeartbeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current heartbeat timestamp for a runner, for test assertions.
    pub async fn last_heartbeat(&self, id: RunnerId) -> Option<DateTime<Utc>> {
        self.rows.lock().await.get(&id).copied()
    }

    /// Age a runner's heartbeat backwards, simulating a crashed peer.
    pub async fn force_expire(&self, id: RunnerId, age: chrono::Duration) {
        let mut rows = self.rows.lock().await;
        if let Some(ts) = rows.get_mut(&id) {
            *ts = Utc::now() - age;
        }
    }
}

#[async_trait]
impl HeartbeatStore for MemoryHeartbeatStore {
    async fn create(&self, id: RunnerId) -> Result<(), StoreError> {
        self.rows.lock().await.insert(id, Utc::now());
        Ok(())
    }

    async fn touch(&self, id: RunnerId) -> Result<(), StoreError> {
        self.rows.lock().await.insert(id, Utc::now());
        Ok(())
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Heartbeat>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|(_, ts)| **ts <= cutoff)
            .map(|(id, ts)| Heartbeat {
                id: *id,
                last_heartbeat: *ts,
            })
            .collect())
    }

    async fn delete(&self, ids: &[RunnerId]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        for id in ids {
            rows.remove(id);
        }
        Ok(())
    }
}
