use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Accuracy of one elapsed prediction against realised observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub prediction_id: String,
    pub entity: String,
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
    pub mae: f64,
    /// Share of evaluated steps whose actual value fell inside `[lower, upper]`.
    pub coverage: f64,
    pub mean_interval_width: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainReason {
    CoverageBelowFloor,
    MaeAboveCeiling,
}

impl RetrainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrainReason::CoverageBelowFloor => "coverage_below_floor",
            RetrainReason::MaeAboveCeiling => "mae_above_ceiling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coverage_below_floor" => Some(RetrainReason::CoverageBelowFloor),
            "mae_above_ceiling" => Some(RetrainReason::MaeAboveCeiling),
            _ => None,
        }
    }
}

/// Advisory request for a new training run, consumed once by the next
/// successful train of the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainSignal {
    pub entity: String,
    pub version: String,
    pub reason: RetrainReason,
    pub rolling_coverage: f64,
    pub rolling_mae: f64,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetrainDecision {
    Keep,
    Retrain(RetrainSignal),
}

/// Sample-weighted aggregate over a run of reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingMetrics {
    pub reports: usize,
    pub samples: usize,
    pub mae: f64,
    pub coverage: f64,
    pub mean_interval_width: f64,
}

impl RollingMetrics {
    pub fn from_reports<'a>(reports: impl IntoIterator<Item = &'a EvaluationReport>) -> Self {
        let mut out = RollingMetrics::default();
        let mut mae = 0.0;
        let mut coverage = 0.0;
        let mut width = 0.0;
        for r in reports {
            let n = r.sample_count as f64;
            out.reports += 1;
            out.samples += r.sample_count;
            mae += r.mae * n;
            coverage += r.coverage * n;
            width += r.mean_interval_width * n;
        }
        if out.samples > 0 {
            let n = out.samples as f64;
            out.mae = mae / n;
            out.coverage = coverage / n;
            out.mean_interval_width = width / n;
        }
        out
    }
}
