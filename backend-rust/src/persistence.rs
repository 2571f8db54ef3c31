//! persistence.rs — Alert and rider presence storage
//!
//! Two backends behind one `Datastore` enum:
//! - `PgStore`: Postgres through sqlx. Claims and status changes are single
//!   conditional `UPDATE ... RETURNING` statements, so the at-most-one-responder
//!   rule holds across any number of backend instances.
//! - `MemoryStore`: used when no `DATABASE_URL` is configured and in tests.
//!   The same conditional updates run under one write lock.
//!
//! Conditional updates return `None` when their guard did not match. Callers
//! re-read the record to explain why.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ridesafe_types::{AlertLocation, AlertRecord, AlertStatus, RiderPresence};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::StoreError;

#[derive(Clone)]
pub enum Datastore {
    Postgres(PgStore),
    Memory(MemoryStore),
}

impl Datastore {
    pub fn memory() -> Self {
        Datastore::Memory(MemoryStore::default())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Datastore::Postgres(_) => "postgres",
            Datastore::Memory(_) => "memory",
        }
    }

    pub async fn insert_alert(&self, alert: &AlertRecord) -> Result<(), StoreError> {
        match self {
            Datastore::Postgres(pg) => pg.insert_alert(alert).await,
            Datastore::Memory(mem) => {
                mem.insert_alert(alert).await;
                Ok(())
            }
        }
    }

    pub async fn get_alert(&self, id: &str) -> Result<Option<AlertRecord>, StoreError> {
        match self {
            Datastore::Postgres(pg) => pg.get_alert(id).await,
            Datastore::Memory(mem) => Ok(mem.get_alert(id).await),
        }
    }

    /// Assigns a responder if the alert is claimable and has none yet.
    pub async fn claim_alert(
        &self,
        id: &str,
        responder_device_id: &str,
        responder_name: Option<&str>,
        now_ms: i64,
    ) -> Result<Option<AlertRecord>, StoreError> {
        match self {
            Datastore::Postgres(pg) => pg.claim_alert(id, responder_device_id, responder_name, now_ms).await,
            Datastore::Memory(mem) => Ok(mem.claim_alert(id, responder_device_id, responder_name, now_ms).await),
        }
    }

    /// Moves a TRIGGERED alert to `to`. Any other current status leaves it untouched.
    pub async fn transition_from_triggered(
        &self,
        id: &str,
        to: AlertStatus,
        now_ms: i64,
    ) -> Result<Option<AlertRecord>, StoreError> {
        match self {
            Datastore::Postgres(pg) => pg.transition_from_triggered(id, to, now_ms).await,
            Datastore::Memory(mem) => Ok(mem.transition_from_triggered(id, to, now_ms).await),
        }
    }

    pub async fn upsert_presence(
        &self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
        timestamp: i64,
        now_ms: i64,
    ) -> Result<RiderPresence, StoreError> {
        match self {
            Datastore::Postgres(pg) => pg.upsert_presence(device_id, latitude, longitude, timestamp, now_ms).await,
            Datastore::Memory(mem) => Ok(mem.upsert_presence(device_id, latitude, longitude, timestamp, now_ms).await),
        }
    }

    /// Riders whose last heartbeat arrived at or after `seen_since_ms`.
    pub async fn active_riders(&self, seen_since_ms: i64) -> Result<Vec<RiderPresence>, StoreError> {
        match self {
            Datastore::Postgres(pg) => pg.active_riders(seen_since_ms).await,
            Datastore::Memory(mem) => Ok(mem.active_riders(seen_since_ms).await),
        }
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryTables {
    alerts: HashMap<String, AlertRecord>,
    riders: HashMap<String, RiderPresence>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<MemoryTables>>,
}

impl MemoryStore {
    pub async fn insert_alert(&self, alert: &AlertRecord) {
        self.tables.write().await.alerts.insert(alert.id.clone(), alert.clone());
    }

    pub async fn get_alert(&self, id: &str) -> Option<AlertRecord> {
        self.tables.read().await.alerts.get(id).cloned()
    }

    async fn claim_alert(
        &self,
        id: &str,
        responder_device_id: &str,
        responder_name: Option<&str>,
        now_ms: i64,
    ) -> Option<AlertRecord> {
        let mut tables = self.tables.write().await;
        let alert = tables.alerts.get_mut(id)?;
        if !alert.status.is_claimable() || alert.responder_device_id.is_some() {
            return None;
        }
        alert.status = AlertStatus::ResponderAssigned;
        alert.responder_device_id = Some(responder_device_id.to_string());
        alert.responder_name = responder_name.map(str::to_string);
        alert.assigned_at = Some(now_ms);
        alert.updated_at = now_ms;
        Some(alert.clone())
    }

    async fn transition_from_triggered(&self, id: &str, to: AlertStatus, now_ms: i64) -> Option<AlertRecord> {
        let mut tables = self.tables.write().await;
        let alert = tables.alerts.get_mut(id)?;
        if alert.status != AlertStatus::Triggered {
            return None;
        }
        alert.status = to;
        alert.updated_at = now_ms;
        Some(alert.clone())
    }

    async fn upsert_presence(
        &self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
        timestamp: i64,
        now_ms: i64,
    ) -> RiderPresence {
        let mut tables = self.tables.write().await;
        let rider = tables.riders.entry(device_id.to_string()).or_insert_with(|| RiderPresence {
            device_id: device_id.to_string(),
            latitude,
            longitude,
            timestamp,
            last_seen_at: now_ms,
            created_at: now_ms,
            updated_at: now_ms,
        });
        rider.latitude = latitude;
        rider.longitude = longitude;
        rider.timestamp = timestamp;
        rider.last_seen_at = now_ms;
        rider.updated_at = now_ms;
        rider.clone()
    }

    async fn active_riders(&self, seen_since_ms: i64) -> Vec<RiderPresence> {
        self.tables
            .read()
            .await
            .riders
            .values()
            .filter(|r| r.last_seen_at >= seen_since_ms)
            .cloned()
            .collect()
    }
}

// ── Postgres ──────────────────────────────────────────────────────────────────

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS alerts (
        id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL,
        victim_name TEXT,
        status TEXT NOT NULL,
        triggered_at BIGINT NOT NULL,
        location JSONB,
        responder_device_id TEXT,
        responder_name TEXT,
        assigned_at BIGINT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS alerts_device_id_idx ON alerts (device_id)",
    "CREATE TABLE IF NOT EXISTS rider_presence (
        device_id TEXT PRIMARY KEY,
        latitude DOUBLE PRECISION NOT NULL,
        longitude DOUBLE PRECISION NOT NULL,
        fix_timestamp BIGINT NOT NULL,
        last_seen_at BIGINT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS rider_presence_last_seen_idx ON rider_presence (last_seen_at)",
];

#[derive(Debug, FromRow)]
struct AlertRow {
    id: String,
    device_id: String,
    victim_name: Option<String>,
    status: String,
    triggered_at: i64,
    location: Option<Json<AlertLocation>>,
    responder_device_id: Option<String>,
    responder_name: Option<String>,
    assigned_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<AlertRow> for AlertRecord {
    type Error = StoreError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<AlertStatus>()
            .map_err(|e| StoreError::Corrupt { id: row.id.clone(), reason: e.to_string() })?;
        Ok(AlertRecord {
            id: row.id,
            device_id: row.device_id,
            victim_name: row.victim_name,
            status,
            triggered_at: row.triggered_at,
            location: row.location.map(|Json(loc)| loc),
            responder_device_id: row.responder_device_id,
            responder_name: row.responder_name,
            assigned_at: row.assigned_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PresenceRow {
    device_id: String,
    latitude: f64,
    longitude: f64,
    fix_timestamp: i64,
    last_seen_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl From<PresenceRow> for RiderPresence {
    fn from(row: PresenceRow) -> Self {
        RiderPresence {
            device_id: row.device_id,
            latitude: row.latitude,
            longitude: row.longitude,
            timestamp: row.fix_timestamp,
            last_seen_at: row.last_seen_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn claimable_statuses() -> Vec<String> {
    AlertStatus::CLAIMABLE.iter().map(|s| s.as_str().to_string()).collect()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects and creates missing tables. Fails when the database is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!("🗄  Connected to Postgres");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_alert(&self, alert: &AlertRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO alerts (id, device_id, victim_name, status, triggered_at, location,
                responder_device_id, responder_name, assigned_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&alert.id)
        .bind(&alert.device_id)
        .bind(&alert.victim_name)
        .bind(alert.status.as_str())
        .bind(alert.triggered_at)
        .bind(alert.location.as_ref().map(Json))
        .bind(&alert.responder_device_id)
        .bind(&alert.responder_name)
        .bind(alert.assigned_at)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_alert(&self, id: &str) -> Result<Option<AlertRecord>, StoreError> {
        sqlx::query_as::<_, AlertRow>("SELECT * FROM alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(AlertRecord::try_from)
            .transpose()
    }

    async fn claim_alert(
        &self,
        id: &str,
        responder_device_id: &str,
        responder_name: Option<&str>,
        now_ms: i64,
    ) -> Result<Option<AlertRecord>, StoreError> {
        sqlx::query_as::<_, AlertRow>(
            "UPDATE alerts
                SET status = $2, responder_device_id = $3, responder_name = $4, assigned_at = $5, updated_at = $5
              WHERE id = $1 AND status = ANY($6) AND responder_device_id IS NULL
              RETURNING *",
        )
        .bind(id)
        .bind(AlertStatus::ResponderAssigned.as_str())
        .bind(responder_device_id)
        .bind(responder_name)
        .bind(now_ms)
        .bind(claimable_statuses())
        .fetch_optional(&self.pool)
        .await?
        .map(AlertRecord::try_from)
        .transpose()
    }

    async fn transition_from_triggered(
        &self,
        id: &str,
        to: AlertStatus,
        now_ms: i64,
    ) -> Result<Option<AlertRecord>, StoreError> {
        sqlx::query_as::<_, AlertRow>(
            "UPDATE alerts SET status = $2, updated_at = $3
              WHERE id = $1 AND status = $4
              RETURNING *",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(now_ms)
        .bind(AlertStatus::Triggered.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(AlertRecord::try_from)
        .transpose()
    }

    async fn upsert_presence(
        &self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
        timestamp: i64,
        now_ms: i64,
    ) -> Result<RiderPresence, StoreError> {
        let row = sqlx::query_as::<_, PresenceRow>(
            "INSERT INTO rider_presence
                (device_id, latitude, longitude, fix_timestamp, last_seen_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5, $5)
             ON CONFLICT (device_id) DO UPDATE SET
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                fix_timestamp = EXCLUDED.fix_timestamp,
                last_seen_at = EXCLUDED.last_seen_at,
                updated_at = EXCLUDED.updated_at
             RETURNING *",
        )
        .bind(device_id)
        .bind(latitude)
        .bind(longitude)
        .bind(timestamp)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn active_riders(&self, seen_since_ms: i64) -> Result<Vec<RiderPresence>, StoreError> {
        let rows = sqlx::query_as::<_, PresenceRow>("SELECT * FROM rider_presence WHERE last_seen_at >= $1")
            .bind(seen_since_ms)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RiderPresence::from).collect())
    }
}
