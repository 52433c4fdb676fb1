use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::crowd::AlertKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::VecDeque;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::info;

/// Upper bound on rows kept by the in-memory log
const MEMORY_RETENTION: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct CountRecord {
    pub id: i64,
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub id: i64,
    pub kind: String,
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of per-frame counts and raised alerts.
///
/// Queries return the newest rows first.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_count(&self, count: u32, at: DateTime<Utc>) -> Result<()>;
    async fn append_alert(&self, kind: AlertKind, count: u32, at: DateTime<Utc>) -> Result<()>;
    async fn recent_counts(&self, limit: usize) -> Result<Vec<CountRecord>>;
    async fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryLogStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    counts: VecDeque<CountRecord>,
    alerts: VecDeque<AlertRecord>,
    next_id: i64,
}

impl MemoryInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append_count(&self, count: u32, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let id = inner.next_id();
        inner.counts.push_back(CountRecord {
            id,
            count,
            timestamp: at,
        });
        if inner.counts.len() > MEMORY_RETENTION {
            inner.counts.pop_front();
        }
        Ok(())
    }

    async fn append_alert(&self, kind: AlertKind, count: u32, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let id = inner.next_id();
        inner.alerts.push_back(AlertRecord {
            id,
            kind: kind.as_str().to_string(),
            count,
            timestamp: at,
        });
        if inner.alerts.len() > MEMORY_RETENTION {
            inner.alerts.pop_front();
        }
        Ok(())
    }

    async fn recent_counts(&self, limit: usize) -> Result<Vec<CountRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.counts.iter().rev().take(limit).cloned().collect())
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.alerts.iter().rev().take(limit).cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.counts.clear();
        inner.alerts.clear();
        Ok(())
    }
}

/// SQLite-backed log, schema managed by the embedded migrations
#[derive(Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {}", database_url))?
            .create_if_missing(true);

        // Every connection to an in-memory database is a separate database,
        // and it is gone once its only connection closes
        let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        info!(url = %database_url, "connected crowd log database");
        Ok(Self { pool })
    }
}

fn to_count(value: i64) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("stored count out of range: {}", value))
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn append_count(&self, count: u32, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO detection_log (count, timestamp) VALUES (?, ?)")
            .bind(i64::from(count))
            .bind(at)
            .execute(&self.pool)
            .await
            .context("failed to insert count")?;
        Ok(())
    }

    async fn append_alert(&self, kind: AlertKind, count: u32, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO alert_log (type, count, timestamp) VALUES (?, ?, ?)")
            .bind(kind.as_str())
            .bind(i64::from(count))
            .bind(at)
            .execute(&self.pool)
            .await
            .context("failed to insert alert")?;
        Ok(())
    }

    async fn recent_counts(&self, limit: usize) -> Result<Vec<CountRecord>> {
        let rows = sqlx::query(
            "SELECT id, count, timestamp FROM detection_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to query counts")?;

        rows.iter()
            .map(|row| -> Result<CountRecord> {
                Ok(CountRecord {
                    id: row.try_get("id")?,
                    count: to_count(row.try_get("count")?)?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query(
            "SELECT id, type, count, timestamp FROM alert_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to query alerts")?;

        rows.iter()
            .map(|row| -> Result<AlertRecord> {
                Ok(AlertRecord {
                    id: row.try_get("id")?,
                    kind: row.try_get("type")?,
                    count: to_count(row.try_get("count")?)?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM detection_log")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM alert_log").execute(&mut *tx).await?;
        tx.commit().await.context("failed to clear crowd log")?;
        Ok(())
    }
}
