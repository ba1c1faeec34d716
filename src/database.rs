use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::errors::{CameraError, Result};
use crate::models::{CameraRecord, Credentials};

const TABLE_CAMERAS: &str = "cameras";

/// Durable key-value store for camera records, keyed by camera id.
/// Each call is atomic on its own; `get_all_cameras` reflects every prior
/// successful write.
#[async_trait]
pub trait CameraStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn add_or_update_camera(&self, record: &CameraRecord) -> Result<bool>;

    async fn get_all_cameras(&self) -> Result<Vec<CameraRecord>>;

    /// Returns false when no record with `id` existed.
    async fn delete_camera(&self, id: &str) -> Result<bool>;
}

pub struct SqliteCameraStore {
    pool: SqlitePool,
}

impl SqliteCameraStore {
    pub async fn new(database_path: &str) -> Result<Self> {
        // Ensure the directory exists
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let database_url = format!("sqlite://{}?mode=rwc", database_path);
        let pool = SqlitePool::connect(&database_url).await?;
        info!("Opened camera database at '{}'", database_path);

        Ok(Self { pool })
    }
}

#[async_trait]
impl CameraStore for SqliteCameraStore {
    async fn initialize(&self) -> Result<()> {
        let create_cameras_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                manufacturer TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                firmware_version TEXT NOT NULL DEFAULT '',
                serial_number TEXT NOT NULL DEFAULT '',
                stream_uri TEXT NOT NULL DEFAULT '',
                display_name TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
            TABLE_CAMERAS
        );
        sqlx::query(&create_cameras_query)
            .execute(&self.pool)
            .await?;

        let idx_endpoint = format!(
            "CREATE INDEX IF NOT EXISTS idx_cameras_endpoint ON {}(address, port)",
            TABLE_CAMERAS
        );
        sqlx::query(&idx_endpoint)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn add_or_update_camera(&self, record: &CameraRecord) -> Result<bool> {
        let query = format!(
            r#"
            INSERT OR REPLACE INTO {} (id, address, port, username, password, manufacturer, model,
                firmware_version, serial_number, stream_uri, display_name, location, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            TABLE_CAMERAS
        );
        let result = sqlx::query(&query)
            .bind(&record.id)
            .bind(&record.address)
            .bind(i64::from(record.port))
            .bind(&record.credentials.username)
            .bind(&record.credentials.password)
            .bind(&record.manufacturer)
            .bind(&record.model)
            .bind(&record.firmware_version)
            .bind(&record.serial_number)
            .bind(&record.stream_uri)
            .bind(&record.display_name)
            .bind(&record.location)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_all_cameras(&self) -> Result<Vec<CameraRecord>> {
        let query = format!(
            r#"
            SELECT id, address, port, username, password, manufacturer, model, firmware_version,
                   serial_number, stream_uri, display_name, location, created_at, updated_at
            FROM {}
            ORDER BY created_at ASC
            "#,
            TABLE_CAMERAS
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let port: i64 = row.try_get("port")?;
            let port = u16::try_from(port).map_err(|_| {
                CameraError::storage(format!("camera '{}' has out-of-range port {}", id, port))
            })?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
            records.push(CameraRecord {
                id,
                address: row.try_get("address")?,
                port,
                credentials: Credentials::new(
                    row.try_get::<String, _>("username")?,
                    row.try_get::<String, _>("password")?,
                ),
                manufacturer: row.try_get("manufacturer")?,
                model: row.try_get("model")?,
                firmware_version: row.try_get("firmware_version")?,
                serial_number: row.try_get("serial_number")?,
                stream_uri: row.try_get("stream_uri")?,
                display_name: row.try_get("display_name")?,
                location: row.try_get("location")?,
                created_at,
                updated_at,
            });
        }

        Ok(records)
    }

    async fn delete_camera(&self, id: &str) -> Result<bool> {
        let query = format!("DELETE FROM {} WHERE id = ?", TABLE_CAMERAS);
        let result = sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Volatile store for deployments without a database file.
#[derive(Default)]
pub struct MemoryCameraStore {
    records: RwLock<HashMap<String, CameraRecord>>,
}

impl MemoryCameraStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CameraStore for MemoryCameraStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn add_or_update_camera(&self, record: &CameraRecord) -> Result<bool> {
        self.records.write().await.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn get_all_cameras(&self) -> Result<Vec<CameraRecord>> {
        let mut records: Vec<CameraRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn delete_camera(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}
