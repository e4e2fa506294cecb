use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QualityBounds;

/// Meteorological covariates recorded with every observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Covariates {
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    /// Degrees clockwise from north.
    pub wind_direction: f64,
    pub pressure: f64,
}

/// One hourly record for an entity. Read-only to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub concentration: f64,
    pub covariates: Covariates,
    pub valid: bool,
}

impl Observation {
    /// Usable as model input: flagged valid and every field inside its bounds.
    pub fn is_usable(&self, bounds: &QualityBounds) -> bool {
        let c = &self.covariates;
        self.valid
            && bounds.concentration.contains(self.concentration)
            && bounds.temperature.contains(c.temperature)
            && bounds.humidity.contains(c.humidity)
            && bounds.wind_speed.contains(c.wind_speed)
            && bounds.wind_direction.contains(c.wind_direction)
            && bounds.pressure.contains(c.pressure)
    }
}

/// Truncate a timestamp to the start of its UTC hour.
pub fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}
