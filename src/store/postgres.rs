//! Postgres implementations of the unit and heartbeat stores.
//!
//! All queries are runtime-checked so the crate builds without a database
//! on hand. Dedup rides on `ON CONFLICT DO NOTHING`; the reclaim lease is
//! a `FOR UPDATE SKIP LOCKED` row lock held for one short transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::unit::{RunnerId, Unit, UnitStatus};

use super::{
    Heartbeat, HeartbeatStore, InsertOutcome, ReclaimOutcome, StoreError, UnitPatch, UnitStore,
};

/// Open a connection pool against the configured database.
pub async fn connect(config: &StoreConfig) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect(&config.url)
        .await
        .map_err(Into::into)
}

/// Create the schema if it does not exist yet. Safe to run at every start.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS units (
            id             TEXT PRIMARY KEY,
            runner_id      UUID,
            url            TEXT NOT NULL,
            body           JSONB NOT NULL,
            tenant         TEXT NOT NULL,
            response_topic TEXT,
            result         JSONB,
            status         TEXT NOT NULL,
            created        TIMESTAMPTZ NOT NULL,
            updated        TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_units_owner
        ON units (runner_id, status)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS heartbeats (
            id             UUID PRIMARY KEY,
            last_heartbeat TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

type UnitRow = (
    String,                    // id
    Option<Uuid>,              // runner_id
    String,                    // url
    serde_json::Value,         // body
    String,                    // tenant
    Option<String>,            // response_topic
    Option<serde_json::Value>, // result
    String,                    // status
    DateTime<Utc>,             // created
    DateTime<Utc>,             // updated
);

fn unit_from_row(row: UnitRow) -> Result<Unit, StoreError> {
    let (id, runner_id, url, body, tenant, response_topic, result, status, created, updated) = row;
    let status = UnitStatus::parse(&status).ok_or_else(|| StoreError::CorruptRow {
        id: id.clone(),
        reason: format!("unknown status {status:?}"),
    })?;
    Ok(Unit {
        id,
        runner_id: runner_id.map(RunnerId::from),
        url,
        body,
        tenant,
        response_topic,
        result,
        status,
        created,
        updated,
    })
}

const SELECT_UNIT: &str = "SELECT id, runner_id, url, body, tenant, response_topic, \
                           result, status, created, updated FROM units";

#[derive(Clone)]
pub struct PgUnitStore {
    pool: PgPool,
}

impl PgUnitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UnitStore for PgUnitStore {
    async fn insert(&self, unit: &Unit) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO units
                (id, runner_id, url, body, tenant, response_topic, result, status, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&unit.id)
        .bind(unit.runner_id.map(|r| r.as_uuid()))
        .bind(&unit.url)
        .bind(&unit.body)
        .bind(&unit.tenant)
        .bind(&unit.response_topic)
        .bind(&unit.result)
        .bind(unit.status.as_str())
        .bind(unit.created)
        .bind(unit.updated)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(if inserted == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn update_fields(&self, id: &str, patch: UnitPatch) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE units SET
                status    = COALESCE($2, status),
                runner_id = COALESCE($3, runner_id),
                result    = COALESCE($4, result),
                updated   = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.runner_id.map(|r| r.as_uuid()))
        .bind(patch.result)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::Backend(format!("no unit with id {id}")));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Unit>, StoreError> {
        let row: Option<UnitRow> =
            sqlx::query_as(&format!("{SELECT_UNIT} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(unit_from_row).transpose()
    }

    async fn list_owned_unfinished(&self, runner_id: RunnerId) -> Result<Vec<Unit>, StoreError> {
        let rows: Vec<UnitRow> = sqlx::query_as(&format!(
            "{SELECT_UNIT} WHERE runner_id = $1 AND status IN ('received', 'in_progress')"
        ))
        .bind(runner_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(unit_from_row).collect()
    }

    async fn reclaim_to_unowned(
        &self,
        id: &str,
        previous_owner: RunnerId,
    ) -> Result<ReclaimOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Lease the row, skipping it if a concurrent sweeper already holds
        // the lock or has moved it on. The WHERE clause re-checks owner and
        // status so the loser of the race matches zero rows.
        let leased: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM units
            WHERE id = $1
              AND runner_id = $2
              AND status IN ('received', 'in_progress')
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(id)
        .bind(previous_owner.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        if leased.is_none() {
            tx.commit().await?;
            return Ok(ReclaimOutcome::Skipped);
        }

        sqlx::query(
            r#"
            UPDATE units
            SET runner_id = NULL, status = 'received', updated = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReclaimOutcome::Reclaimed)
    }
}

#[derive(Clone)]
pub struct PgHeartbeatStore {
    pool: PgPool,
}

impl PgHeartbeatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HeartbeatStore for PgHeartbeatStore {
    async fn create(&self, id: RunnerId) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO heartbeats (id, last_heartbeat) VALUES ($1, now())")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch(&self, id: RunnerId) -> Result<(), StoreError> {
        sqlx::query("UPDATE heartbeats SET last_heartbeat = now() WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Heartbeat>, StoreError> {
        let rows: Vec<(Uuid, DateTime<Utc>)> =
            sqlx::query_as("SELECT id, last_heartbeat FROM heartbeats WHERE last_heartbeat <= $1")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, last_heartbeat)| Heartbeat {
                id: RunnerId::from(id),
                last_heartbeat,
            })
            .collect())
    }

    async fn delete(&self, ids: &[RunnerId]) -> Result<(), StoreError> {
        let ids: Vec<Uuid> = ids.iter().map(|r| r.as_uuid()).collect();
        sqlx::query("DELETE FROM heartbeats WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
