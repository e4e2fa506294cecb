use std::collections::BTreeMap;

use tokio::task::JoinHandle;

use crate::error::{EngineError, EngineResult};

/// One blocking worker per entity. At most one worker per entity is live,
/// so two training runs for the same entity never race on the registry.
///
/// Every spawn request yields exactly one entry from `join_all`: finished
/// workers are kept until joined, and a refused request reports
/// `TrainingInProgress`.
pub struct TrainingPool<T> {
    workers: BTreeMap<String, Vec<JoinHandle<EngineResult<T>>>>,
    refused: Vec<String>,
}

impl<T: Send + 'static> Default for TrainingPool<T> {
    fn default() -> Self {
        Self {
            workers: BTreeMap::new(),
            refused: Vec::new(),
        }
    }
}

impl<T: Send + 'static> TrainingPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `job` on the blocking pool. Returns `false` without spawning
    /// when a worker for `entity` is still running.
    pub fn spawn<F>(&mut self, entity: impl Into<String>, job: F) -> bool
    where
        F: FnOnce() -> EngineResult<T> + Send + 'static,
    {
        let entity = entity.into();
        if self.is_running(&entity) {
            tracing::warn!(entity = %entity, "Training already running; not starting another");
            self.refused.push(entity);
            return false;
        }
        self.workers
            .entry(entity)
            .or_default()
            .push(tokio::task::spawn_blocking(job));
        true
    }

    pub fn is_running(&self, entity: &str) -> bool {
        self.workers
            .get(entity)
            .and_then(|handles| handles.last())
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Spawn requests so far, refused ones included.
    pub fn len(&self) -> usize {
        self.workers.values().map(Vec::len).sum::<usize>() + self.refused.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every worker. Results come back in entity order, and in
    /// spawn order within one entity.
    pub async fn join_all(self) -> Vec<(String, EngineResult<T>)> {
        let mut out = Vec::with_capacity(self.len());
        for (entity, handles) in self.workers {
            for handle in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(EngineError::WorkerFailed {
                        entity: entity.clone(),
                        detail: e.to_string(),
                    }),
                };
                out.push((entity.clone(), result));
            }
        }
        for entity in self.refused {
            let err = EngineError::TrainingInProgress {
                entity: entity.clone(),
            };
            out.push((entity, Err(err)));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
