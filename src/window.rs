use chrono::{DateTime, Duration, Utc};

use crate::config::{EngineConfig, QualityBounds};
use crate::error::{EngineError, EngineResult};
use crate::model::observation::{hour_floor, Observation};
use crate::source::ObservationSource;

/// Exactly `len()` contiguous hourly observations ending at `end`.
#[derive(Debug, Clone)]
pub struct Window {
    pub entity: String,
    pub end: DateTime<Utc>,
    pub observations: Vec<Observation>,
    /// Hours filled by interpolation rather than read from the source.
    pub repaired_hours: usize,
}

impl Window {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.observations
            .first()
            .map(|o| o.timestamp)
            .unwrap_or(self.end)
    }

    pub fn concentrations(&self) -> Vec<f64> {
        self.observations.iter().map(|o| o.concentration).collect()
    }
}

pub struct WindowLoader<S> {
    source: S,
    window_hours: usize,
    max_gap_hours: usize,
    bounds: QualityBounds,
}

impl<S: ObservationSource> WindowLoader<S> {
    pub fn new(source: S, engine: &EngineConfig, bounds: QualityBounds) -> Self {
        Self {
            source,
            window_hours: engine.window_hours.max(1),
            max_gap_hours: engine.max_gap_hours,
            bounds,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn window_hours(&self) -> usize {
        self.window_hours
    }

    /// Load the window of `window_hours` ending at the hour containing `end`.
    ///
    /// Runs of up to `max_gap_hours` missing or unusable hours are repaired:
    /// concentration is linearly interpolated between the neighbouring hours
    /// and covariates are carried forward. Longer runs fail.
    pub fn load(&self, entity: &str, end: DateTime<Utc>) -> EngineResult<Window> {
        let end = hour_floor(end);
        let start = end - Duration::hours(self.window_hours as i64 - 1);
        let raw = self
            .source
            .fetch_observations(entity, start, end)
            .map_err(|e| EngineError::Source(format!("{e:#}")))?;

        let mut slots: Vec<Option<Observation>> = vec![None; self.window_hours];
        let mut usable = 0usize;
        for obs in raw {
            let ts = hour_floor(obs.timestamp);
            if ts < start || ts > end {
                continue;
            }
            let idx = (ts - start).num_hours() as usize;
            if slots[idx].is_some() {
                return Err(EngineError::Source(format!(
                    "duplicate observation for {entity} at {ts}"
                )));
            }
            if obs.is_usable(&self.bounds) {
                slots[idx] = Some(Observation {
                    timestamp: ts,
                    ..obs
                });
                usable += 1;
            }
        }

        let insufficient = |detail: String| EngineError::DataInsufficient {
            entity: entity.to_string(),
            expected: self.window_hours,
            end,
            detail,
        };
        if usable == 0 {
            return Err(insufficient("source returned no usable observations".into()));
        }
        if slots[0].is_none() || slots[self.window_hours - 1].is_none() {
            return Err(insufficient(format!(
                "only {usable} usable observations and the window edges are not covered"
            )));
        }

        let mut repaired = 0usize;
        let mut i = 1;
        while i < self.window_hours {
            if slots[i].is_some() {
                i += 1;
                continue;
            }
            let run_start = i;
            while i < self.window_hours && slots[i].is_none() {
                i += 1;
            }
            let missing = i - run_start;
            if missing > self.max_gap_hours {
                return Err(EngineError::IrreparableGap {
                    entity: entity.to_string(),
                    gap_start: start + Duration::hours(run_start as i64),
                    missing_hours: missing,
                    tolerance: self.max_gap_hours,
                });
            }
            // Both neighbours exist: the edges were checked above.
            let (Some(prev), Some(next)) = (slots[run_start - 1], slots[i]) else {
                continue;
            };
            for k in 0..missing {
                let frac = (k + 1) as f64 / (missing + 1) as f64;
                slots[run_start + k] = Some(Observation {
                    timestamp: start + Duration::hours((run_start + k) as i64),
                    concentration: prev.concentration
                        + frac * (next.concentration - prev.concentration),
                    covariates: prev.covariates,
                    valid: true,
                });
            }
            repaired += missing;
        }

        if repaired > 0 {
            tracing::debug!(entity, repaired, end = %end, "Repaired short gaps in window");
        }

        Ok(Window {
            entity: entity.to_string(),
            end,
            observations: slots.into_iter().flatten().collect(),
            repaired_hours: repaired,
        })
    }
}
