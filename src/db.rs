use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::PersistenceError;
use crate::mirror::Mirror;
use crate::models::VehicleRecord;

type VehicleRow = (
    String,
    f64,
    f64,
    String,
    Option<String>,
    Option<bool>,
    Option<String>,
    i64,
);

/// SQLite-backed durable mirror of the vehicle registry
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection pool and initialize schema
    pub async fn new(path: &str) -> Result<Self> {
        let database_url = format!("sqlite://{}?mode=rwc", path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vehicles (
                id TEXT PRIMARY KEY,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                mode TEXT NOT NULL,
                route_id TEXT,
                sharing INTEGER,
                role TEXT,
                last_update INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create vehicles table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_last_update ON vehicles(last_update)")
            .execute(&self.pool)
            .await
            .context("Failed to create last_update index")?;

        tracing::debug!("Database schema initialized");
        Ok(())
    }

    /// Get total count of stored vehicles
    pub async fn count_vehicles(&self) -> Result<i64, PersistenceError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vehicles")
            .fetch_one(&self.pool)
            .await
            .map_err(PersistenceError::database("count vehicles"))?;

        Ok(row.0)
    }
}

fn from_row(row: VehicleRow) -> Option<VehicleRecord> {
    let (id, lat, lon, mode, route_id, sharing, role, last_update_ms) = row;
    let Some(last_update) = DateTime::<Utc>::from_timestamp_millis(last_update_ms) else {
        tracing::warn!(id = %id, last_update_ms, "Skipping stored vehicle with invalid timestamp");
        return None;
    };

    Some(VehicleRecord {
        id,
        lat,
        lon,
        mode,
        route_id,
        sharing,
        role,
        last_update,
    })
}

#[async_trait]
impl Mirror for Database {
    async fn load_all(&self) -> Result<Vec<VehicleRecord>, PersistenceError> {
        let rows: Vec<VehicleRow> = sqlx::query_as(
            "SELECT id, latitude, longitude, mode, route_id, sharing, role, last_update
             FROM vehicles",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(PersistenceError::database("load vehicles"))?;

        let records: Vec<VehicleRecord> = rows.into_iter().filter_map(from_row).collect();
        tracing::debug!(count = records.len(), "Loaded vehicles from database");
        Ok(records)
    }

    async fn upsert(&self, record: &VehicleRecord) -> Result<(), PersistenceError> {
        // Write-behind tasks can land out of order; never let an older
        // position replace a newer one.
        sqlx::query(
            "INSERT INTO vehicles (
                id, latitude, longitude, mode, route_id, sharing, role, last_update
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                mode = excluded.mode,
                route_id = excluded.route_id,
                sharing = excluded.sharing,
                role = excluded.role,
                last_update = excluded.last_update
            WHERE excluded.last_update >= vehicles.last_update",
        )
        .bind(&record.id)
        .bind(record.lat)
        .bind(record.lon)
        .bind(&record.mode)
        .bind(&record.route_id)
        .bind(record.sharing)
        .bind(&record.role)
        .bind(record.last_update.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(PersistenceError::database("upsert vehicle"))?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM vehicles WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::database("delete vehicle"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM vehicles WHERE last_update < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::database("delete stale vehicles"))?;

        tracing::debug!(removed = result.rows_affected(), "Deleted stale vehicles");
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM vehicles")
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::database("clear vehicles"))?;

        Ok(result.rows_affected())
    }
}
