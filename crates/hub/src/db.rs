use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::store::SensorValue;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Work handed from the coordinator to the persistence sink.
#[derive(Debug, Clone)]
pub enum PersistMsg {
    Snapshot {
        ts: i64,
        body: serde_json::Value,
    },
    Reading {
        ts: i64,
        sensor: String,
        value: SensorValue,
    },
    Watering {
        ts_start: i64,
        ts_end: i64,
        level: f64,
        duration_sec: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredReading {
    pub ts: i64,
    pub value: SensorValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct WateringEvent {
    pub ts_start: i64,
    pub ts_end: i64,
    pub level: f64,
    pub duration_sec: f64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/growbox/growbox.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // every connection to :memory: is its own database
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Store snapshot
    // ----------------------------

    pub async fn save_snapshot(&self, ts: i64, body: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_string(body).context("encode snapshot")?;
        sqlx::query(
            r#"
            INSERT INTO store_snapshot (id, ts, body) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET ts=excluded.ts, body=excluded.body
            "#,
        )
        .bind(ts)
        .bind(body)
        .execute(&self.pool)
        .await
        .context("save_snapshot failed")?;
        Ok(())
    }

    pub async fn load_snapshot(&self) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM store_snapshot WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("load_snapshot failed")?;

        row.map(|(body,)| serde_json::from_str(&body).context("decode snapshot"))
            .transpose()
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, ts: i64, sensor: &str, value: &SensorValue) -> Result<()> {
        let value = serde_json::to_string(value).context("encode reading")?;
        sqlx::query("INSERT INTO readings (ts, sensor, value) VALUES (?, ?, ?)")
            .bind(ts)
            .bind(sensor)
            .bind(value)
            .execute(&self.pool)
            .await
            .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_readings(&self, sensor: &str, limit: i64) -> Result<Vec<StoredReading>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT ts, value
            FROM readings
            WHERE sensor = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(sensor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")?;

        rows.into_iter()
            .map(|(ts, value)| {
                Ok(StoredReading {
                    ts,
                    value: serde_json::from_str(&value).context("decode reading")?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Watering events
    // ----------------------------

    pub async fn insert_watering_event(
        &self,
        ts_start: i64,
        ts_end: i64,
        level: f64,
        duration_sec: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watering_events (ts_start, ts_end, level, duration_sec)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(ts_start)
        .bind(ts_end)
        .bind(level)
        .bind(duration_sec)
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_waterings(&self, limit: i64) -> Result<Vec<WateringEvent>> {
        let rows: Vec<(i64, i64, f64, f64)> = sqlx::query_as(
            r#"
            SELECT ts_start, ts_end, level, duration_sec
            FROM watering_events
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_waterings failed")?;

        Ok(rows
            .into_iter()
            .map(|(ts_start, ts_end, level, duration_sec)| WateringEvent {
                ts_start,
                ts_end,
                level,
                duration_sec,
            })
            .collect())
    }

    pub async fn apply(&self, msg: PersistMsg) -> Result<()> {
        match msg {
            PersistMsg::Snapshot { ts, body } => self.save_snapshot(ts, &body).await,
            PersistMsg::Reading { ts, sensor, value } => {
                self.insert_reading(ts, &sensor, &value).await
            }
            PersistMsg::Watering {
                ts_start,
                ts_end,
                level,
                duration_sec,
            } => {
                self.insert_watering_event(ts_start, ts_end, level, duration_sec)
                    .await
            }
        }
    }
}

/// Persistence sink: applies messages until every sender is gone.
/// Failures are logged; the coordinator never waits on the database.
pub async fn run_sink(db: Db, mut rx: mpsc::Receiver<PersistMsg>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = db.apply(msg).await {
            error!("db: {e:#}");
        }
    }
    info!("persistence sink stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EnvRecord;
    use serde_json::json;

    async fn db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn snapshot_is_a_single_row() {
        let db = db().await;
        assert!(db.load_snapshot().await.unwrap().is_none());

        db.save_snapshot(1, &json!({"profile": "basil"})).await.unwrap();
        db.save_snapshot(2, &json!({"profile": "tomato"})).await.unwrap();

        let snap = db.load_snapshot().await.unwrap().unwrap();
        assert_eq!(snap["profile"], "tomato");
    }

    #[tokio::test]
    async fn readings_keep_both_shapes() {
        let db = db().await;
        let env = SensorValue::Environment(EnvRecord {
            temperature: 24.0,
            humidity: 60.0,
            gas: 120_000.0,
            pressure: 1013.0,
            altitude: 5.0,
        });
        db.insert_reading(10, "soil_1", &SensorValue::Moisture(55.5)).await.unwrap();
        db.insert_reading(11, "soil_1", &SensorValue::Moisture(56.0)).await.unwrap();
        db.insert_reading(11, "env", &env).await.unwrap();

        let soil = db.recent_readings("soil_1", 10).await.unwrap();
        assert_eq!(soil.len(), 2);
        assert_eq!(soil[0].ts, 11);
        assert_eq!(soil[0].value, SensorValue::Moisture(56.0));

        let envs = db.recent_readings("env", 1).await.unwrap();
        assert_eq!(envs[0].value, env);
    }

    #[tokio::test]
    async fn sink_applies_messages_in_order() {
        let db = db().await;
        let (tx, rx) = mpsc::channel(8);
        let sink = tokio::spawn(run_sink(db.clone(), rx));

        tx.send(PersistMsg::Watering {
            ts_start: 100,
            ts_end: 112,
            level: 42.0,
            duration_sec: 12.0,
        })
        .await
        .unwrap();
        tx.send(PersistMsg::Snapshot {
            ts: 112,
            body: json!({"timing": {}}),
        })
        .await
        .unwrap();
        drop(tx);
        sink.await.unwrap();

        let events = db.recent_waterings(5).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration_sec, 12.0);
        assert!(db.load_snapshot().await.unwrap().is_some());
    }
}
