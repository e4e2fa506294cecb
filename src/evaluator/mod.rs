pub mod policy;
pub mod types;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::QualityBounds;
use crate::error::{EngineError, EngineResult};
use crate::model::observation::hour_floor;
use crate::model::prediction::PredictionRecord;
use crate::source::ObservationSource;

pub use policy::RetrainPolicy;
pub use types::{EvaluationReport, RetrainDecision, RetrainReason, RetrainSignal, RollingMetrics};

/// Scores elapsed predictions against ground truth read from the source.
pub struct Evaluator<S> {
    source: S,
    bounds: QualityBounds,
    expiry_grace: Duration,
}

impl<S: ObservationSource> Evaluator<S> {
    pub fn new(source: S, bounds: QualityBounds) -> Self {
        Self {
            source,
            bounds,
            expiry_grace: Duration::hours(24),
        }
    }

    pub fn with_expiry_grace(mut self, grace: Duration) -> Self {
        self.expiry_grace = grace;
        self
    }

    /// `None` while the horizon has not fully elapsed at `now`, or while no
    /// usable observation covers any step and the expiry grace is still
    /// running. Past the grace such a record gets a zero-sample report so it
    /// leaves the pending queue.
    pub fn evaluate_record(
        &self,
        record: &PredictionRecord,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<EvaluationReport>> {
        let (Some(first), Some(last)) = (record.steps.first(), record.steps.last()) else {
            return Ok(None);
        };
        if last.target_time > now {
            return Ok(None);
        }
        let actuals: HashMap<DateTime<Utc>, f64> = self
            .source
            .fetch_observations(&record.entity, first.target_time, last.target_time)
            .map_err(|e| EngineError::Source(format!("{e:#}")))?
            .into_iter()
            .filter(|o| o.is_usable(&self.bounds))
            .map(|o| (hour_floor(o.timestamp), o.concentration))
            .collect();

        let mut n = 0usize;
        let mut abs_err = 0.0;
        let mut covered = 0usize;
        let mut width = 0.0;
        for step in &record.steps {
            let Some(actual) = actuals.get(&step.target_time).copied() else {
                continue;
            };
            n += 1;
            abs_err += (step.point - actual).abs();
            if step.covers(actual) {
                covered += 1;
            }
            width += step.width();
        }
        if n == 0 {
            if now < last.target_time + self.expiry_grace {
                return Ok(None);
            }
            tracing::warn!(
                entity = %record.entity,
                version = %record.version,
                prediction_id = %record.id,
                "Prediction expired without usable actuals"
            );
            return Ok(Some(EvaluationReport {
                prediction_id: record.id.clone(),
                entity: record.entity.clone(),
                version: record.version.clone(),
                generated_at: record.generated_at,
                evaluated_at: now,
                mae: 0.0,
                coverage: 0.0,
                mean_interval_width: 0.0,
                sample_count: 0,
            }));
        }

        let report = EvaluationReport {
            prediction_id: record.id.clone(),
            entity: record.entity.clone(),
            version: record.version.clone(),
            generated_at: record.generated_at,
            evaluated_at: now,
            mae: abs_err / n as f64,
            coverage: covered as f64 / n as f64,
            mean_interval_width: width / n as f64,
            sample_count: n,
        };
        tracing::info!(
            entity = %report.entity,
            version = %report.version,
            mae = report.mae,
            coverage = report.coverage,
            samples = report.sample_count,
            "Evaluated prediction"
        );
        Ok(Some(report))
    }
}
