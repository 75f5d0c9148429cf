//! Durable home for metric snapshots and alert events.
//!
//! "Latest" means most recently persisted, not greatest `captured_at`:
//! snapshots are appended in fetch-completion order.

use std::collections::HashMap;

use async_trait::async_trait;
use ciq_core::{AlertEvent, MetricSnapshot};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Idempotent on `(entity_id, captured_at)`; returns whether a new row was written.
    async fn save_snapshot(&self, snapshot: &MetricSnapshot) -> Result<bool, RepositoryError>;

    async fn load_latest_snapshot(
        &self,
        entity_id: &str,
    ) -> Result<Option<MetricSnapshot>, RepositoryError>;

    async fn save_alert_event(&self, event: &AlertEvent) -> Result<(), RepositoryError>;
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    snapshots: Mutex<HashMap<String, Vec<MetricSnapshot>>>,
    alerts: Mutex<Vec<AlertEvent>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshots_for(&self, entity_id: &str) -> Vec<MetricSnapshot> {
        self.snapshots
            .lock()
            .await
            .get(entity_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn alert_events(&self) -> Vec<AlertEvent> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotRepository for MemoryRepository {
    async fn save_snapshot(&self, snapshot: &MetricSnapshot) -> Result<bool, RepositoryError> {
        let mut snapshots = self.snapshots.lock().await;
        let history = snapshots.entry(snapshot.entity_id.clone()).or_default();
        if history
            .iter()
            .any(|existing| existing.captured_at == snapshot.captured_at)
        {
            debug!(entity_id = %snapshot.entity_id, "snapshot already persisted");
            return Ok(false);
        }
        history.push(snapshot.clone());
        Ok(true)
    }

    async fn load_latest_snapshot(
        &self,
        entity_id: &str,
    ) -> Result<Option<MetricSnapshot>, RepositoryError> {
        Ok(self
            .snapshots
            .lock()
            .await
            .get(entity_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn save_alert_event(&self, event: &AlertEvent) -> Result<(), RepositoryError> {
        let mut alerts = self.alerts.lock().await;
        if !alerts
            .iter()
            .any(|e| e.rule_id == event.rule_id && e.triggered_at == event.triggered_at)
        {
            alerts.push(event.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotRepository for PgRepository {
    async fn save_snapshot(&self, snapshot: &MetricSnapshot) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO metric_snapshots \
             (entity_id, captured_at, price, rank, rating, review_count, available) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (entity_id, captured_at) DO NOTHING",
        )
        .bind(&snapshot.entity_id)
        .bind(snapshot.captured_at)
        .bind(snapshot.price)
        .bind(snapshot.rank.map(i64::from))
        .bind(snapshot.rating)
        .bind(snapshot.review_count.map(i64::from))
        .bind(snapshot.available)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_latest_snapshot(
        &self,
        entity_id: &str,
    ) -> Result<Option<MetricSnapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT entity_id, captured_at, price, rank, rating, review_count, available \
             FROM metric_snapshots WHERE entity_id = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let rank: Option<i64> = row.try_get("rank")?;
        let review_count: Option<i64> = row.try_get("review_count")?;
        Ok(Some(MetricSnapshot {
            entity_id: row.try_get("entity_id")?,
            captured_at: row.try_get("captured_at")?,
            price: row.try_get("price")?,
            rank: rank.and_then(|v| u32::try_from(v).ok()),
            rating: row.try_get("rating")?,
            review_count: review_count.and_then(|v| u32::try_from(v).ok()),
            available: row.try_get("available")?,
        }))
    }

    async fn save_alert_event(&self, event: &AlertEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO alert_events \
             (rule_id, entity_id, metric, triggered_at, old_value, new_value, delta) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (rule_id, triggered_at) DO NOTHING",
        )
        .bind(&event.rule_id)
        .bind(&event.entity_id)
        .bind(event.metric.as_str())
        .bind(event.triggered_at)
        .bind(event.old_value)
        .bind(event.new_value)
        .bind(event.delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn snapshot(entity: &str, minutes: i64, price: f64) -> MetricSnapshot {
        MetricSnapshot {
            entity_id: entity.into(),
            captured_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
                + Duration::minutes(minutes),
            price: Some(price),
            rank: Some(100),
            rating: None,
            review_count: None,
            available: true,
        }
    }

    #[tokio::test]
    async fn latest_is_last_persisted_and_saves_are_idempotent() {
        let repo = MemoryRepository::new();
        assert!(repo.load_latest_snapshot("B001").await.unwrap().is_none());

        assert!(repo.save_snapshot(&snapshot("B001", 10, 20.0)).await.unwrap());
        // Completed later but captured earlier: still the latest persisted.
        assert!(repo.save_snapshot(&snapshot("B001", 5, 18.0)).await.unwrap());
        assert!(!repo.save_snapshot(&snapshot("B001", 10, 20.0)).await.unwrap());

        let latest = repo.load_latest_snapshot("B001").await.unwrap().unwrap();
        assert_eq!(latest.price, Some(18.0));
        assert_eq!(repo.snapshots_for("B001").await.len(), 2);
    }
}
