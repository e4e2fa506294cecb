use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::model::observation::Observation;

/// Read-only query interface onto the persistence layer that owns observations.
///
/// Implementations return observations with `start <= timestamp <= end` in
/// ascending timestamp order without duplicate timestamps.
pub trait ObservationSource: Send + Sync {
    fn fetch_observations(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>>;
}

impl<T: ObservationSource + ?Sized> ObservationSource for Arc<T> {
    fn fetch_observations(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        (**self).fetch_observations(entity_id, start, end)
    }
}

/// Observation source held in memory, used for replays and offline runs.
#[derive(Debug, Default)]
pub struct InMemoryObservationSource {
    by_entity: RwLock<HashMap<String, Vec<Observation>>>,
}

impl InMemoryObservationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge observations for an entity, replacing any with the same timestamp.
    pub fn extend(&self, entity_id: &str, observations: impl IntoIterator<Item = Observation>) {
        let mut guard = match self.by_entity.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let series = guard.entry(entity_id.to_string()).or_default();
        for obs in observations {
            match series.binary_search_by_key(&obs.timestamp, |o| o.timestamp) {
                Ok(idx) => series[idx] = obs,
                Err(idx) => series.insert(idx, obs),
            }
        }
    }

    pub fn len(&self, entity_id: &str) -> usize {
        self.by_entity
            .read()
            .map(|g| g.get(entity_id).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl ObservationSource for InMemoryObservationSource {
    fn fetch_observations(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let guard = self
            .by_entity
            .read()
            .map_err(|_| anyhow!("observation cache lock poisoned"))?;
        let Some(series) = guard.get(entity_id) else {
            return Ok(Vec::new());
        };
        let from = series.partition_point(|o| o.timestamp < start);
        let to = series.partition_point(|o| o.timestamp <= end);
        Ok(series[from..to.max(from)].to_vec())
    }
}
