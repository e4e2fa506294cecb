use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::config::PredictConfig;
use crate::error::{EngineError, EngineResult};
use crate::features::{FeatureMatrix, FeatureTransformer};
use crate::model::prediction::{prediction_id, ForecastStep, PredictionRecord};
use crate::registry::{DeployedModel, ModelRegistry};
use crate::source::ObservationSource;
use crate::window::WindowLoader;

/// Serves forecasts from the current registry version of each entity.
///
/// Loaded versions are cached per entity. Every call re-reads the registry's
/// current pointer and reuses the cached entry only if it is that exact
/// version, so a promotion is picked up by the next call and a forecast is
/// always computed from one (model, offset, scaler) triple.
pub struct Predictor<S> {
    loader: WindowLoader<S>,
    transformer: FeatureTransformer,
    registry: Arc<ModelRegistry>,
    clamp_non_negative: bool,
    cache: RwLock<HashMap<String, Arc<DeployedModel>>>,
}

impl<S: ObservationSource> Predictor<S> {
    pub fn new(
        loader: WindowLoader<S>,
        transformer: FeatureTransformer,
        registry: Arc<ModelRegistry>,
        predict: &PredictConfig,
    ) -> Self {
        Self {
            loader,
            transformer,
            registry,
            clamp_non_negative: predict.clamp_non_negative,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &WindowLoader<S> {
        &self.loader
    }

    pub fn current_model(&self, entity: &str) -> EngineResult<Arc<DeployedModel>> {
        let version = self
            .registry
            .current_version(entity)?
            .ok_or_else(|| EngineError::StaleModel {
                entity: entity.to_string(),
            })?;

        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(entity).filter(|m| m.version() == version) {
                return Ok(Arc::clone(hit));
            }
        }

        let model = Arc::new(self.registry.get_current(entity)?);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(entity.to_string(), Arc::clone(&model));
        }
        tracing::debug!(entity, version = %model.version(), "Loaded model into prediction cache");
        Ok(model)
    }

    pub fn cached_version(&self, entity: &str) -> Option<String> {
        self.cache
            .read()
            .ok()
            .and_then(|c| c.get(entity).map(|m| m.version().to_string()))
    }

    pub fn invalidate(&self, entity: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(entity);
        }
    }

    pub fn predict(&self, entity: &str, as_of: DateTime<Utc>) -> EngineResult<PredictionRecord> {
        let model = self.current_model(entity)?;
        let window = self.loader.load(entity, as_of)?;
        let matrix = self.transformer.transform(&window, &model.scaler)?;
        let record = self.forecast(entity, &model, &matrix, window.end)?;
        tracing::info!(
            entity,
            version = %record.version,
            generated_at = %record.generated_at,
            "Served prediction"
        );
        Ok(record)
    }

    /// Run `model` on the last row of `matrix` and map the heads back to
    /// physical units with conformal offsets applied. An interval with
    /// `lower > upper` or a non-finite bound is an error, never served.
    pub fn forecast(
        &self,
        entity: &str,
        model: &DeployedModel,
        matrix: &FeatureMatrix,
        generated_at: DateTime<Utc>,
    ) -> EngineResult<PredictionRecord> {
        let last = matrix
            .last_row()
            .ok_or_else(|| EngineError::DataInsufficient {
                entity: entity.to_string(),
                expected: 1,
                end: generated_at,
                detail: "feature matrix is empty".to_string(),
            })?;
        let out = model.artifact.network.forward(last);
        let scaler = &model.scaler;
        let offset = &model.artifact.offset;

        let version = model.version().to_string();
        let steps = (0..model.artifact.network.horizon)
            .map(|h| {
                let mut point = scaler.inverse_target(out.point[h]);
                let (mut lower, mut upper) = offset.apply(
                    h,
                    scaler.inverse_target(out.low[h]),
                    scaler.inverse_target(out.high[h]),
                );
                // Checked before clamping: `max` would hide a NaN.
                if !(point.is_finite() && lower.is_finite() && upper.is_finite()) || lower > upper {
                    return Err(EngineError::InvalidForecast {
                        entity: entity.to_string(),
                        version: version.clone(),
                        step: h,
                        detail: format!("lower {lower} upper {upper} point {point}"),
                    });
                }
                if self.clamp_non_negative {
                    point = point.max(0.0);
                    lower = lower.max(0.0);
                    upper = upper.max(0.0);
                }
                Ok(ForecastStep {
                    target_time: generated_at + Duration::hours(h as i64 + 1),
                    point,
                    lower,
                    upper,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(PredictionRecord {
            id: prediction_id(entity, &version, generated_at),
            entity: entity.to_string(),
            version,
            generated_at,
            steps,
        })
    }
}
