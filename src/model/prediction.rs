use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One horizon step of a forecast, in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastStep {
    pub target_time: DateTime<Utc>,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ForecastStep {
    pub fn covers(&self, actual: f64) -> bool {
        actual >= self.lower && actual <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Output of one inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub entity: String,
    pub version: String,
    /// End of the input window; horizon step `h` targets `generated_at + h` hours.
    pub generated_at: DateTime<Utc>,
    pub steps: Vec<ForecastStep>,
}

impl PredictionRecord {
    pub fn horizon_end(&self) -> Option<DateTime<Utc>> {
        self.steps.last().map(|s| s.target_time)
    }
}

/// Content-derived id so that repeated predictions with the same inputs collapse.
pub fn prediction_id(entity: &str, version: &str, generated_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity.as_bytes());
    hasher.update(b"::");
    hasher.update(version.as_bytes());
    hasher.update(b"::");
    hasher.update(generated_at.timestamp().to_be_bytes());
    let digest = hasher.finalize();
    format!("pred-{}", &hex::encode(digest)[..16])
}
