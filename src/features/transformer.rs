use chrono::{DateTime, Datelike, Timelike, Utc};
use std::f64::consts::PI;

use super::scaler::Scaler;
use crate::error::{EngineError, EngineResult};
use crate::window::Window;

/// Bumped whenever a column is added, removed or redefined. Scalers fitted
/// under another version are rejected at transform time.
pub const FEATURE_SET_VERSION: u32 = 1;

pub const FEATURE_COLUMNS: [&str; 16] = [
    "hour_sin",
    "hour_cos",
    "dow_sin",
    "dow_cos",
    "is_weekend",
    "target",
    "target_lag1",
    "target_lag2",
    "rolling_mean",
    "rolling_std",
    "temperature",
    "humidity",
    "wind_speed",
    "pressure",
    "wind_sin",
    "wind_cos",
];

/// Scaled features for the rows of a window past the warm-up.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub feature_set_version: u32,
    pub timestamps: Vec<DateTime<Utc>>,
    pub rows: Vec<Vec<f64>>,
    /// Scaled target, aligned with `rows`.
    pub target: Vec<f64>,
    /// Target in physical units, aligned with `rows`.
    pub raw_target: Vec<f64>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        FEATURE_COLUMNS.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last_row(&self) -> Option<&[f64]> {
        self.rows.last().map(Vec::as_slice)
    }
}

struct RawFeatures {
    timestamps: Vec<DateTime<Utc>>,
    rows: Vec<Vec<f64>>,
    target: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureTransformer {
    rolling_window: usize,
    feature_set_version: u32,
}

impl FeatureTransformer {
    pub fn new(rolling_window: usize) -> Self {
        Self {
            rolling_window: rolling_window.max(2),
            feature_set_version: FEATURE_SET_VERSION,
        }
    }

    pub fn with_feature_set_version(mut self, version: u32) -> Self {
        self.feature_set_version = version;
        self
    }

    pub fn feature_set_version(&self) -> u32 {
        self.feature_set_version
    }

    /// Leading window hours consumed by the lag and rolling features.
    pub fn warmup(&self) -> usize {
        (self.rolling_window - 1).max(2)
    }

    pub fn rows_for(&self, window_len: usize) -> usize {
        window_len.saturating_sub(self.warmup())
    }

    /// Compute features and fit a new scaler on the first `fit_rows` rows.
    pub fn fit(&self, window: &Window, fit_rows: usize) -> EngineResult<(FeatureMatrix, Scaler)> {
        let raw = self.raw_features(window)?;
        let fit_rows = fit_rows.clamp(1, raw.rows.len());
        let scaler = Scaler::fit(
            self.feature_set_version,
            &FEATURE_COLUMNS,
            &raw.rows[..fit_rows],
            &raw.target[..fit_rows],
        );
        let matrix = self.apply(raw, &scaler);
        Ok((matrix, scaler))
    }

    pub fn transform(&self, window: &Window, scaler: &Scaler) -> EngineResult<FeatureMatrix> {
        if scaler.feature_set_version != self.feature_set_version
            || scaler.features.len() != FEATURE_COLUMNS.len()
        {
            return Err(EngineError::ScalerMismatch {
                expected: self.feature_set_version,
                found: scaler.feature_set_version,
            });
        }
        let raw = self.raw_features(window)?;
        Ok(self.apply(raw, scaler))
    }

    fn apply(&self, raw: RawFeatures, scaler: &Scaler) -> FeatureMatrix {
        FeatureMatrix {
            feature_set_version: self.feature_set_version,
            rows: raw.rows.iter().map(|r| scaler.transform_row(r)).collect(),
            target: raw.target.iter().map(|v| scaler.transform_target(*v)).collect(),
            raw_target: raw.target,
            timestamps: raw.timestamps,
        }
    }

    fn raw_features(&self, window: &Window) -> EngineResult<RawFeatures> {
        let warmup = self.warmup();
        if window.len() <= warmup {
            return Err(EngineError::DataInsufficient {
                entity: window.entity.clone(),
                expected: warmup + 1,
                end: window.end,
                detail: format!("window has {} hours, features need a warm-up of {warmup}", window.len()),
            });
        }

        let conc = window.concentrations();
        let n = self.rows_for(window.len());
        let mut timestamps = Vec::with_capacity(n);
        let mut rows = Vec::with_capacity(n);
        let mut target = Vec::with_capacity(n);

        for i in warmup..window.len() {
            let obs = &window.observations[i];
            let ts = obs.timestamp;
            let hour = ts.hour() as f64;
            let dow = ts.weekday().num_days_from_monday() as f64;
            let (mean, std) = mean_std(&conc[i + 1 - self.rolling_window..=i]);
            let wind = obs.covariates.wind_direction.to_radians();
            let c = &obs.covariates;

            rows.push(vec![
                (2.0 * PI * hour / 24.0).sin(),
                (2.0 * PI * hour / 24.0).cos(),
                (2.0 * PI * dow / 7.0).sin(),
                (2.0 * PI * dow / 7.0).cos(),
                if dow >= 5.0 { 1.0 } else { 0.0 },
                conc[i],
                conc[i - 1],
                conc[i - 2],
                mean,
                std,
                c.temperature,
                c.humidity,
                c.wind_speed,
                c.pressure,
                wind.sin(),
                wind.cos(),
            ]);
            target.push(conc[i]);
            timestamps.push(ts);
        }

        Ok(RawFeatures {
            timestamps,
            rows,
            target,
        })
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
