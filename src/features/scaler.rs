use serde::{Deserialize, Serialize};

/// z-score parameters for one column. Near-constant columns keep a unit
/// scale so `inverse(transform(x)) == x` holds for every input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnScaler {
    pub mean: f64,
    pub scale: f64,
}

impl ColumnScaler {
    const EPSILON: f64 = 1e-10;

    pub fn fit(values: impl IntoIterator<Item = f64>) -> Self {
        let mut n = 0usize;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for v in values {
            n += 1;
            sum += v;
            sum_sq += v * v;
        }
        if n == 0 {
            return Self {
                mean: 0.0,
                scale: 1.0,
            };
        }
        let mean = sum / n as f64;
        let var = (sum_sq / n as f64 - mean * mean).max(0.0);
        let std = var.sqrt();
        Self {
            mean,
            scale: if std < Self::EPSILON { 1.0 } else { std },
        }
    }

    pub fn transform(&self, v: f64) -> f64 {
        (v - self.mean) / self.scale
    }

    pub fn inverse(&self, v: f64) -> f64 {
        v * self.scale + self.mean
    }
}

/// Per-entity normalisation fitted once at training time and reused unchanged
/// at inference until the entity is retrained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub feature_set_version: u32,
    pub columns: Vec<String>,
    pub features: Vec<ColumnScaler>,
    pub target: ColumnScaler,
    /// Number of leading rows the parameters were fitted on.
    pub fitted_rows: usize,
}

impl Scaler {
    pub fn fit(
        feature_set_version: u32,
        columns: &[&str],
        rows: &[Vec<f64>],
        target: &[f64],
    ) -> Self {
        let features = (0..columns.len())
            .map(|c| ColumnScaler::fit(rows.iter().map(|r| r[c])))
            .collect();
        Self {
            feature_set_version,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            features,
            target: ColumnScaler::fit(target.iter().copied()),
            fitted_rows: rows.len(),
        }
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(&self.features)
            .map(|(v, s)| s.transform(*v))
            .collect()
    }

    pub fn inverse_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(&self.features)
            .map(|(v, s)| s.inverse(*v))
            .collect()
    }

    pub fn transform_target(&self, v: f64) -> f64 {
        self.target.transform(v)
    }

    pub fn inverse_target(&self, v: f64) -> f64 {
        self.target.inverse(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn constant_column_keeps_unit_scale() {
        let s = ColumnScaler::fit([3.0, 3.0, 3.0]);
        assert_relative_eq!(s.mean, 3.0);
        assert_relative_eq!(s.scale, 1.0);
        assert_relative_eq!(s.inverse(s.transform(7.5)), 7.5);
    }

    #[test]
    fn fitted_column_has_zero_mean_unit_variance() {
        let values = [2.0, 4.0, 6.0, 8.0, 10.0];
        let s = ColumnScaler::fit(values);
        let t: Vec<f64> = values.iter().map(|v| s.transform(*v)).collect();
        let mean = t.iter().sum::<f64>() / t.len() as f64;
        let var = t.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / t.len() as f64;
        assert_relative_eq!(mean, 0.0, epsilon = 1e-12);
        assert_relative_eq!(var, 1.0, epsilon = 1e-12);
    }
}
