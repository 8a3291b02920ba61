//! SQLite persistence layer (via sqlx): devices, readings, alerts, and alert
//! events. Readings are append-only; devices/alerts are upserted in place.

use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};

use crate::codec::{Quality, Reading, SensorKind, TirePosition};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReadingRow {
    pub device_id: String,
    pub sensor_kind: String,
    pub position: String,
    pub value: f64,
    pub unit: String,
    pub device_timestamp: i64,
    pub ingest_timestamp: i64,
    pub quality: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlertRow {
    pub alert_id: String,
    pub device_id: String,
    pub rule_id: String,
    pub severity: String,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub last_value: f64,
    pub threshold: f64,
    pub state: String,
}

fn sensor_kind_str(kind: SensorKind) -> &'static str {
    match kind {
        SensorKind::Pressure => "pressure",
        SensorKind::Temperature => "temperature",
        SensorKind::Humidity => "humidity",
        SensorKind::Battery => "battery",
        SensorKind::Accel => "accel",
        SensorKind::Light => "light",
        SensorKind::Composite => "composite",
        SensorKind::Unknown => "unknown",
    }
}

fn position_str(pos: TirePosition) -> &'static str {
    match pos {
        TirePosition::FrontLeft => "front_left",
        TirePosition::FrontRight => "front_right",
        TirePosition::RearLeft => "rear_left",
        TirePosition::RearRight => "rear_right",
        TirePosition::None => "none",
    }
}

fn quality_str(q: Quality) -> &'static str {
    match q {
        Quality::Good => "good",
        Quality::Suspect => "suspect",
        Quality::Invalid => "invalid",
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/gateway/gateway.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run database migrations")?;
        Ok(())
    }

    /// Batched append-only insert. Readings are never updated or deleted
    /// except by the retention pruner.
    pub async fn insert_readings(&self, readings: &[Reading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("begin insert_readings tx")?;
        for chunk in readings.chunks(500) {
            let mut qb = QueryBuilder::new(
                "INSERT INTO readings (device_id, sensor_kind, position, value, unit, device_timestamp, ingest_timestamp, quality) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(&r.device_id)
                    .push_bind(sensor_kind_str(r.sensor_kind))
                    .push_bind(position_str(r.position))
                    .push_bind(r.value)
                    .push_bind(r.unit)
                    .push_bind(r.device_timestamp)
                    .push_bind(r.ingest_timestamp)
                    .push_bind(quality_str(r.quality));
            });
            qb.build().execute(&mut *tx).await.context("insert readings batch")?;
        }
        tx.commit().await.context("commit insert_readings tx")?;
        Ok(())
    }

    pub async fn list_readings(&self, device_id: &str, limit: i64) -> Result<Vec<ReadingRow>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            "SELECT device_id, sensor_kind, position, value, unit, device_timestamp, ingest_timestamp, quality
             FROM readings WHERE device_id = ? ORDER BY ingest_timestamp DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_readings")?;
        Ok(rows)
    }

    /// Delete readings older than `cutoff_unix`, for the retention pruner.
    pub async fn prune_old_readings(&self, cutoff_unix: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM readings WHERE ingest_timestamp < ?")
            .bind(cutoff_unix)
            .execute(&self.pool)
            .await
            .context("prune_old_readings")?;
        sqlx::query("PRAGMA incremental_vacuum")
            .execute(&self.pool)
            .await
            .context("incremental_vacuum after prune")?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_device(
        &self,
        device_id: &str,
        kind: &str,
        credentials_fingerprint: Option<&str>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (device_id, kind, credentials_fingerprint, known_since, last_seen_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET kind = excluded.kind,
                 credentials_fingerprint = excluded.credentials_fingerprint",
        )
        .bind(device_id)
        .bind(kind)
        .bind(credentials_fingerprint)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("upsert_device")?;
        Ok(())
    }

    pub async fn upsert_alert(&self, alert: &AlertRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (alert_id, device_id, rule_id, severity, opened_at, closed_at, last_value, threshold, state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(device_id, rule_id) DO UPDATE SET
                 alert_id = excluded.alert_id, severity = excluded.severity,
                 opened_at = excluded.opened_at, closed_at = excluded.closed_at,
                 last_value = excluded.last_value, threshold = excluded.threshold,
                 state = excluded.state",
        )
        .bind(&alert.alert_id)
        .bind(&alert.device_id)
        .bind(&alert.rule_id)
        .bind(&alert.severity)
        .bind(alert.opened_at)
        .bind(alert.closed_at)
        .bind(alert.last_value)
        .bind(alert.threshold)
        .bind(&alert.state)
        .execute(&self.pool)
        .await
        .context("upsert_alert")?;
        Ok(())
    }

    pub async fn insert_alert_event(&self, alert_id: &str, event: &str, at: i64) -> Result<()> {
        sqlx::query("INSERT INTO alert_events (alert_id, event, at) VALUES (?, ?, ?)")
            .bind(alert_id)
            .bind(event)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("insert_alert_event")?;
        Ok(())
    }

    pub async fn list_open_alerts(&self) -> Result<Vec<AlertRow>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            "SELECT alert_id, device_id, rule_id, severity, opened_at, closed_at, last_value, threshold, state
             FROM alerts WHERE state = 'firing'",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_open_alerts")?;
        Ok(rows)
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.context("db health check")?;
        Ok(())
    }

    /// Atomic backup via `VACUUM INTO`, then rename into place, matching the
    /// teacher's backup strategy.
    pub async fn backup(&self, dest_path: &str) -> Result<()> {
        let tmp_path = format!("{dest_path}.tmp");
        sqlx::query(&format!("VACUUM INTO '{tmp_path}'"))
            .execute(&self.pool)
            .await
            .context("VACUUM INTO backup")?;
        tokio::fs::rename(&tmp_path, dest_path)
            .await
            .context("rename backup into place")?;
        Ok(())
    }

    /// Raw row count, used only by tests to assert persistence without
    /// threading extra query methods through.
    #[cfg(test)]
    pub async fn reading_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("c"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Quality, SensorKind, TirePosition};

    fn sample_reading(device_id: &str, value: f64, quality: Quality) -> Reading {
        Reading {
            device_id: device_id.into(),
            sensor_kind: SensorKind::Pressure,
            unknown_key: None,
            position: TirePosition::FrontLeft,
            value,
            unit: "kPa",
            device_timestamp: 1_700_000_000,
            ingest_timestamp: 1_700_000_000,
            quality,
        }
    }

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn insert_and_list_readings() {
        let db = memory_db().await;
        db.insert_readings(&[sample_reading("d1", 220.0, Quality::Good)])
            .await
            .unwrap();
        let rows = db.list_readings("d1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quality, "good");
    }

    #[tokio::test]
    async fn out_of_range_value_is_still_stored() {
        let db = memory_db().await;
        db.insert_readings(&[sample_reading("d1", 9999.0, Quality::Invalid)])
            .await
            .unwrap();
        let rows = db.list_readings("d1", 10).await.unwrap();
        assert_eq!(rows[0].value, 9999.0);
        assert_eq!(rows[0].quality, "invalid");
    }

    #[tokio::test]
    async fn prune_removes_old_readings() {
        let db = memory_db().await;
        let mut r = sample_reading("d1", 1.0, Quality::Good);
        r.ingest_timestamp = 100;
        db.insert_readings(&[r]).await.unwrap();
        let removed = db.prune_old_readings(200).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.reading_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_device_is_idempotent() {
        let db = memory_db().await;
        db.upsert_device("d1", "tpms", Some("fp1"), 1).await.unwrap();
        db.upsert_device("d1", "tpms", Some("fp1"), 2).await.unwrap();
    }

    #[tokio::test]
    async fn alert_upsert_enforces_device_rule_uniqueness() {
        let db = memory_db().await;
        let alert = AlertRow {
            alert_id: "a1".into(),
            device_id: "d1".into(),
            rule_id: "tpms_low".into(),
            severity: "critical".into(),
            opened_at: 1,
            closed_at: None,
            last_value: 180.0,
            threshold: 200.0,
            state: "firing".into(),
        };
        db.upsert_alert(&alert).await.unwrap();
        let mut resolved = alert.clone();
        resolved.state = "resolved".into();
        resolved.closed_at = Some(2);
        db.upsert_alert(&resolved).await.unwrap();
        let open = db.list_open_alerts().await.unwrap();
        assert!(open.is_empty());
    }
}
