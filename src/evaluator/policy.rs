use chrono::{DateTime, Utc};

use super::types::{EvaluationReport, RetrainDecision, RetrainReason, RetrainSignal, RollingMetrics};
use crate::config::RetrainConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetrainPolicy {
    cfg: RetrainConfig,
}

impl RetrainPolicy {
    pub fn new(cfg: RetrainConfig) -> Self {
        Self { cfg }
    }

    pub fn evaluation_window(&self) -> usize {
        self.cfg.evaluation_window
    }

    /// Decide from the most recent reports, oldest first. Only reports of
    /// the newest version count, so a fresh model is not blamed for its
    /// predecessor's misses. Zero-sample reports of expired predictions do
    /// not count towards `min_reports`.
    pub fn decide(
        &self,
        entity: &str,
        reports: &[EvaluationReport],
        now: DateTime<Utc>,
    ) -> RetrainDecision {
        let Some(latest) = reports.last() else {
            return RetrainDecision::Keep;
        };
        let window: Vec<&EvaluationReport> = reports
            .iter()
            .rev()
            .filter(|r| r.version == latest.version && r.sample_count > 0)
            .take(self.cfg.evaluation_window)
            .collect();
        if window.len() < self.cfg.min_reports {
            return RetrainDecision::Keep;
        }
        let rolling = RollingMetrics::from_reports(window.iter().copied());
        if rolling.samples == 0 {
            return RetrainDecision::Keep;
        }

        let reason = if rolling.coverage < self.cfg.coverage_floor {
            RetrainReason::CoverageBelowFloor
        } else if rolling.mae > self.cfg.mae_ceiling {
            RetrainReason::MaeAboveCeiling
        } else {
            return RetrainDecision::Keep;
        };
        RetrainDecision::Retrain(RetrainSignal {
            entity: entity.to_string(),
            version: latest.version.clone(),
            reason,
            rolling_coverage: rolling.coverage,
            rolling_mae: rolling.mae,
            raised_at: now,
        })
    }
}
