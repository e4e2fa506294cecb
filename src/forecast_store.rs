use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::evaluator::{EvaluationReport, RetrainReason, RetrainSignal};
use crate::model::prediction::{ForecastStep, PredictionRecord};

/// Writers from other workers hold the lock only briefly.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Sqlite log of served predictions, their evaluation reports and pending
/// retrain signals.
#[derive(Debug, Clone)]
pub struct ForecastStore {
    path: PathBuf,
}

fn to_utc(ts: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .with_context(|| format!("invalid stored timestamp {ts}"))
}

impl ForecastStore {
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
            CREATE TABLE IF NOT EXISTS prediction_records (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                version TEXT NOT NULL,
                generated_at INTEGER NOT NULL,
                horizon_end INTEGER NOT NULL,
                steps_json TEXT NOT NULL,
                evaluated INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_prediction_records_entity
                ON prediction_records(entity_id, horizon_end);

            CREATE TABLE IF NOT EXISTS evaluation_reports (
                prediction_id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                version TEXT NOT NULL,
                generated_at INTEGER NOT NULL,
                evaluated_at INTEGER NOT NULL,
                mae REAL NOT NULL,
                coverage REAL NOT NULL,
                mean_interval_width REAL NOT NULL,
                sample_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS retrain_signals (
                entity_id TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                reason TEXT NOT NULL,
                rolling_coverage REAL NOT NULL,
                rolling_mae REAL NOT NULL,
                raised_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(conn)
    }

    /// Upsert by id; a repeated prediction overwrites itself.
    pub fn record_prediction(&self, record: &PredictionRecord) -> Result<()> {
        let conn = self.connect()?;
        let steps_json =
            serde_json::to_string(&record.steps).context("failed to serialize forecast steps")?;
        let horizon_end = record.horizon_end().unwrap_or(record.generated_at);
        conn.execute(
            r#"
            INSERT INTO prediction_records (
                id, entity_id, version, generated_at, horizon_end, steps_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                steps_json = excluded.steps_json
            "#,
            params![
                record.id,
                record.entity,
                record.version,
                record.generated_at.timestamp(),
                horizon_end.timestamp(),
                steps_json,
            ],
        )?;
        Ok(())
    }

    /// Unevaluated predictions whose horizon ended at or before `now`, oldest first.
    pub fn pending_evaluations(
        &self,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PredictionRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, version, generated_at, steps_json
            FROM prediction_records
            WHERE entity_id = ?1 AND evaluated = 0 AND horizon_end <= ?2
            ORDER BY generated_at ASC
            "#,
        )?;
        let rows = stmt.query_map(params![entity_id, now.timestamp()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, version, generated_at, steps_json) = row?;
            let steps: Vec<ForecastStep> = serde_json::from_str(&steps_json)
                .with_context(|| format!("failed to parse steps of prediction {id}"))?;
            out.push(PredictionRecord {
                id,
                entity: entity_id.to_string(),
                version,
                generated_at: to_utc(generated_at)?,
                steps,
            });
        }
        Ok(out)
    }

    pub fn prediction_count(&self, entity_id: &str) -> Result<usize> {
        let conn = self.connect()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM prediction_records WHERE entity_id = ?1",
            [entity_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(n.max(0) as usize)
    }

    /// Store a report and mark its prediction evaluated.
    pub fn record_evaluation(&self, report: &EvaluationReport) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO evaluation_reports (
                prediction_id, entity_id, version, generated_at, evaluated_at,
                mae, coverage, mean_interval_width, sample_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(prediction_id) DO UPDATE SET
                evaluated_at = excluded.evaluated_at,
                mae = excluded.mae,
                coverage = excluded.coverage,
                mean_interval_width = excluded.mean_interval_width,
                sample_count = excluded.sample_count
            "#,
            params![
                report.prediction_id,
                report.entity,
                report.version,
                report.generated_at.timestamp(),
                report.evaluated_at.timestamp(),
                report.mae,
                report.coverage,
                report.mean_interval_width,
                report.sample_count as i64,
            ],
        )?;
        tx.execute(
            "UPDATE prediction_records SET evaluated = 1 WHERE id = ?1",
            [&report.prediction_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The `limit` most recent reports, returned oldest first.
    pub fn recent_reports(&self, entity_id: &str, limit: usize) -> Result<Vec<EvaluationReport>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT prediction_id, version, generated_at, evaluated_at,
                   mae, coverage, mean_interval_width, sample_count
            FROM evaluation_reports
            WHERE entity_id = ?1
            ORDER BY generated_at DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![entity_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (prediction_id, version, generated_at, evaluated_at, mae, coverage, width, n) = row?;
            out.push(EvaluationReport {
                prediction_id,
                entity: entity_id.to_string(),
                version,
                generated_at: to_utc(generated_at)?,
                evaluated_at: to_utc(evaluated_at)?,
                mae,
                coverage,
                mean_interval_width: width,
                sample_count: n.max(0) as usize,
            });
        }
        out.reverse();
        Ok(out)
    }

    /// At most one pending signal per entity; a newer one replaces it.
    pub fn raise_signal(&self, signal: &RetrainSignal) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO retrain_signals (
                entity_id, version, reason, rolling_coverage, rolling_mae, raised_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(entity_id) DO UPDATE SET
                version = excluded.version,
                reason = excluded.reason,
                rolling_coverage = excluded.rolling_coverage,
                rolling_mae = excluded.rolling_mae,
                raised_at = excluded.raised_at
            "#,
            params![
                signal.entity,
                signal.version,
                signal.reason.as_str(),
                signal.rolling_coverage,
                signal.rolling_mae,
                signal.raised_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn pending_signal(&self, entity_id: &str) -> Result<Option<RetrainSignal>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                r#"
                SELECT version, reason, rolling_coverage, rolling_mae, raised_at
                FROM retrain_signals WHERE entity_id = ?1
                "#,
                [entity_id],
                signal_row,
            )
            .optional()?;
        row.map(|r| signal_from_row(entity_id, r)).transpose()
    }

    /// Remove and return the pending signal, if any. One statement, so a
    /// signal raised concurrently is either returned here or left pending.
    pub fn consume_signal(&self, entity_id: &str) -> Result<Option<RetrainSignal>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                r#"
                DELETE FROM retrain_signals WHERE entity_id = ?1
                RETURNING version, reason, rolling_coverage, rolling_mae, raised_at
                "#,
                [entity_id],
                signal_row,
            )
            .optional()?;
        row.map(|r| signal_from_row(entity_id, r)).transpose()
    }
}

type SignalRow = (String, String, f64, f64, i64);

fn signal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignalRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn signal_from_row(entity_id: &str, row: SignalRow) -> Result<RetrainSignal> {
    let (version, reason, rolling_coverage, rolling_mae, raised_at) = row;
    let reason = RetrainReason::parse(&reason)
        .with_context(|| format!("unknown retrain reason '{reason}' for {entity_id}"))?;
    Ok(RetrainSignal {
        entity: entity_id.to_string(),
        version,
        reason,
        rolling_coverage,
        rolling_mae,
        raised_at: to_utc(raised_at)?,
    })
}
