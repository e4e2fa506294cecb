use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};

use crate::model::observation::{hour_floor, Covariates, Observation};
use crate::source::ObservationSource;

/// Writers from other workers hold the lock only briefly.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Sqlite-backed observation source. Each call opens its own connection so the
/// store can be shared across worker threads.
#[derive(Debug, Clone)]
pub struct SqliteObservationStore {
    path: PathBuf,
}

impl SqliteObservationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let store = Self { path };
        store.connect()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS observations (
                entity_id TEXT NOT NULL,
                observed_at INTEGER NOT NULL,
                concentration REAL NOT NULL,
                temperature REAL NOT NULL,
                humidity REAL NOT NULL,
                wind_speed REAL NOT NULL,
                wind_direction REAL NOT NULL,
                pressure REAL NOT NULL,
                valid INTEGER NOT NULL,
                PRIMARY KEY(entity_id, observed_at)
            );
            "#,
        )?;
        Ok(conn)
    }

    /// Upsert observations; timestamps are normalised to the hour.
    pub fn insert_observations(&self, entity_id: &str, observations: &[Observation]) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for o in observations {
            tx.execute(
                r#"
                INSERT INTO observations (
                    entity_id, observed_at, concentration, temperature, humidity,
                    wind_speed, wind_direction, pressure, valid
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(entity_id, observed_at) DO UPDATE SET
                    concentration = excluded.concentration,
                    temperature = excluded.temperature,
                    humidity = excluded.humidity,
                    wind_speed = excluded.wind_speed,
                    wind_direction = excluded.wind_direction,
                    pressure = excluded.pressure,
                    valid = excluded.valid
                "#,
                params![
                    entity_id,
                    hour_floor(o.timestamp).timestamp(),
                    o.concentration,
                    o.covariates.temperature,
                    o.covariates.humidity,
                    o.covariates.wind_speed,
                    o.covariates.wind_direction,
                    o.covariates.pressure,
                    o.valid as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(observations.len())
    }

    pub fn latest_timestamp(&self, entity_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connect()?;
        let max_ts = conn.query_row(
            "SELECT MAX(observed_at) FROM observations WHERE entity_id = ?1",
            [entity_id],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(max_ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
    }
}

impl ObservationSource for SqliteObservationStore {
    fn fetch_observations(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT observed_at, concentration, temperature, humidity,
                   wind_speed, wind_direction, pressure, valid
            FROM observations
            WHERE entity_id = ?1 AND observed_at >= ?2 AND observed_at <= ?3
            ORDER BY observed_at ASC
            "#,
        )?;
        let rows = stmt.query_map(
            params![entity_id, start.timestamp(), end.timestamp()],
            |row| {
                let ts: i64 = row.get(0)?;
                Ok((
                    ts,
                    Observation {
                        timestamp: DateTime::<Utc>::UNIX_EPOCH,
                        concentration: row.get(1)?,
                        covariates: Covariates {
                            temperature: row.get(2)?,
                            humidity: row.get(3)?,
                            wind_speed: row.get(4)?,
                            wind_direction: row.get(5)?,
                            pressure: row.get(6)?,
                        },
                        valid: row.get::<_, i64>(7)? != 0,
                    },
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            let (ts, mut obs) = row?;
            obs.timestamp = Utc
                .timestamp_opt(ts, 0)
                .single()
                .with_context(|| format!("invalid stored timestamp {ts} for {entity_id}"))?;
            out.push(obs);
        }
        Ok(out)
    }
}
