use serde::{Deserialize, Serialize};

use crate::config::OffsetMode;
use crate::error::{EngineError, EngineResult};

/// Non-negative widening applied to the raw quantile band, in physical units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformalOffset {
    pub mode: OffsetMode,
    /// One value per horizon step, or a single pooled value.
    pub values: Vec<f64>,
    pub alpha: f64,
    pub calibration_samples: usize,
}

impl ConformalOffset {
    pub fn at(&self, step: usize) -> f64 {
        match self.mode {
            OffsetMode::Scalar => self.values.first().copied().unwrap_or(0.0),
            OffsetMode::PerStep => self.values.get(step).copied().unwrap_or(0.0),
        }
    }

    /// `[low - offset, high + offset]` for one step.
    pub fn apply(&self, step: usize, low: f64, high: f64) -> (f64, f64) {
        let off = self.at(step);
        (low - off, high + off)
    }
}

/// Distance by which `actual` falls outside `[low, high]`; negative inside.
pub fn conformity_score(low: f64, high: f64, actual: f64) -> f64 {
    (low - actual).max(actual - high)
}

/// Rank `ceil((n + 1)(1 - alpha))` of `n` scores, 1-based.
pub fn conformal_rank(n: usize, alpha: f64) -> usize {
    ((n as f64 + 1.0) * (1.0 - alpha) - 1e-9).ceil() as usize
}

/// Finite-sample corrected `(1 - alpha)` empirical quantile, floored at zero.
pub fn conformal_quantile(scores: &mut [f64], alpha: f64) -> EngineResult<f64> {
    let n = scores.len();
    let k = conformal_rank(n, alpha);
    if n == 0 || k > n {
        let mut required = n.max(1);
        while conformal_rank(required, alpha) > required {
            required += 1;
        }
        return Err(EngineError::InsufficientCalibrationData {
            available: n,
            required,
        });
    }
    scores.sort_by(|a, b| a.total_cmp(b));
    Ok(scores[k - 1].max(0.0))
}

/// Quantile bands and realised values of the calibration split, indexed
/// `[example][step]`, all in physical units.
pub struct CalibrationSet<'a> {
    pub low: &'a [Vec<f64>],
    pub high: &'a [Vec<f64>],
    pub actual: &'a [Vec<f64>],
}

pub fn calibrate(
    set: &CalibrationSet<'_>,
    horizon: usize,
    alpha: f64,
    mode: OffsetMode,
    min_samples: usize,
) -> EngineResult<ConformalOffset> {
    let n = set.actual.len();
    if n < min_samples {
        return Err(EngineError::InsufficientCalibrationData {
            available: n,
            required: min_samples,
        });
    }
    let score = |i: usize, h: usize| conformity_score(set.low[i][h], set.high[i][h], set.actual[i][h]);

    let values = match mode {
        OffsetMode::PerStep => (0..horizon)
            .map(|h| {
                let mut scores: Vec<f64> = (0..n).map(|i| score(i, h)).collect();
                conformal_quantile(&mut scores, alpha)
            })
            .collect::<EngineResult<Vec<f64>>>()?,
        OffsetMode::Scalar => {
            let mut scores: Vec<f64> = (0..n)
                .flat_map(|i| (0..horizon).map(move |h| (i, h)))
                .map(|(i, h)| score(i, h))
                .collect();
            vec![conformal_quantile(&mut scores, alpha)?]
        }
    };

    Ok(ConformalOffset {
        mode,
        values,
        alpha,
        calibration_samples: n,
    })
}
