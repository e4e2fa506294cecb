use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::evaluator::{EvaluationReport, Evaluator, RetrainDecision, RetrainPolicy, RetrainSignal, RollingMetrics};
use crate::features::FeatureTransformer;
use crate::forecast_store::ForecastStore;
use crate::model::prediction::PredictionRecord;
use crate::nccqr::{NcCqrTrainer, TrainingSummary};
use crate::predictor::Predictor;
use crate::registry::{ModelRegistry, ModelSpec};
use crate::reproducibility::entity_seed;
use crate::runtime::TrainingPool;
use crate::source::ObservationSource;
use crate::window::WindowLoader;

#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub entity: String,
    pub version: String,
    pub window_end: DateTime<Utc>,
    pub summary: TrainingSummary,
    /// Retrain signal this run consumed, if one was pending.
    pub consumed_signal: Option<RetrainSignal>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationOutcome {
    pub entity: String,
    /// Reports produced by this call.
    pub reports: Vec<EvaluationReport>,
    /// Aggregate over the policy's rolling window after this call.
    pub rolling: RollingMetrics,
    pub decision: RetrainDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainReason {
    NeverTrained,
    RetrainSignal,
    StaleDailyVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TrainedToday,
    NoFreshData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum PlanAction {
    Train(TrainReason),
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTraining {
    pub entity: String,
    pub action: PlanAction,
}

/// Per-entity model lifecycle. A pending retrain signal is a flag on a
/// trained model, not a state of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelLifecycle {
    Untrained,
    Trained {
        version: String,
        retrain_pending: bool,
    },
}

fn storage(e: anyhow::Error) -> EngineError {
    EngineError::Storage(format!("{e:#}"))
}

/// The engine's public surface: `train`, `predict` and `evaluate` per entity.
pub struct ForecastEngine<S> {
    config: Config,
    source: S,
    registry: Arc<ModelRegistry>,
    store: ForecastStore,
    trainer: NcCqrTrainer,
    train_loader: WindowLoader<S>,
    predictor: Predictor<S>,
    evaluator: Evaluator<S>,
    policy: RetrainPolicy,
}

impl<S: ObservationSource + Clone + 'static> ForecastEngine<S> {
    pub fn new(config: Config, source: S) -> anyhow::Result<Self> {
        config.validate()?;
        let registry = Arc::new(ModelRegistry::new(config.registry.root.clone()));
        let store = ForecastStore::open(&config.storage.database_path)
            .context("failed to open forecast store")?;
        let transformer = FeatureTransformer::new(config.engine.rolling_window);
        let trainer = NcCqrTrainer::new(&config.engine, config.quantile, config.training, transformer);
        let loader = |s: S| WindowLoader::new(s, &config.engine, config.quality);

        Ok(Self {
            train_loader: loader(source.clone()),
            predictor: Predictor::new(
                loader(source.clone()),
                transformer,
                Arc::clone(&registry),
                &config.predict,
            ),
            evaluator: Evaluator::new(source.clone(), config.quality)
                .with_expiry_grace(Duration::hours(config.retrain.evaluation_grace_hours)),
            policy: RetrainPolicy::new(config.retrain),
            trainer,
            store,
            registry,
            source,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &ForecastStore {
        &self.store
    }

    pub fn predictor(&self) -> &Predictor<S> {
        &self.predictor
    }

    fn require_entity(&self, entity: &str) -> EngineResult<&crate::model::entity::Entity> {
        self.config
            .entity(entity)
            .ok_or_else(|| EngineError::UnknownEntity(entity.to_string()))
    }

    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            feature_set_version: self.trainer.transformer().feature_set_version(),
            window_hours: self.config.engine.window_hours,
            horizon_hours: self.config.engine.horizon_hours,
            rolling_window: self.config.engine.rolling_window,
            tau_lo: self.config.quantile.tau_lo,
            tau_hi: self.config.quantile.tau_hi,
        }
    }

    /// Train on the window ending at `now` and promote the result. A failed
    /// or cancelled run leaves the current version untouched.
    pub fn train(
        &self,
        entity: &str,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> EngineResult<TrainOutcome> {
        let seed = entity_seed(self.require_entity(entity)?, self.config.training.base_seed);
        let started = Instant::now();

        let window = self.train_loader.load(entity, now)?;
        let trained = self.trainer.train(&window, seed, shutdown)?;
        if *shutdown.borrow() {
            return Err(EngineError::Cancelled {
                entity: entity.to_string(),
                epoch: self.config.training.epochs,
            });
        }

        let version = self.registry.publish(
            entity,
            now,
            self.model_spec(),
            &trained,
            self.config.registry.retention_days,
        )?;
        let consumed_signal = self.store.consume_signal(entity).map_err(storage)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            entity,
            version = %version,
            seed,
            elapsed_ms,
            consumed_signal = consumed_signal.is_some(),
            "Training finished"
        );

        Ok(TrainOutcome {
            entity: entity.to_string(),
            version: version.to_string(),
            window_end: window.end,
            summary: trained.summary,
            consumed_signal,
            elapsed_ms,
        })
    }

    /// Forecast from the window ending at `as_of` and log the record.
    pub fn predict(&self, entity: &str, as_of: DateTime<Utc>) -> EngineResult<PredictionRecord> {
        self.require_entity(entity)?;
        let record = self.predictor.predict(entity, as_of)?;
        self.store.record_prediction(&record).map_err(storage)?;
        Ok(record)
    }

    /// Score every logged prediction whose horizon has elapsed, then apply
    /// the retrain policy to the rolling window of reports.
    pub fn evaluate(&self, entity: &str, now: DateTime<Utc>) -> EngineResult<EvaluationOutcome> {
        self.require_entity(entity)?;
        let mut reports = Vec::new();
        for record in self.store.pending_evaluations(entity, now).map_err(storage)? {
            if let Some(report) = self.evaluator.evaluate_record(&record, now)? {
                self.store.record_evaluation(&report).map_err(storage)?;
                reports.push(report);
            }
        }

        let recent = self
            .store
            .recent_reports(entity, self.policy.evaluation_window())
            .map_err(storage)?;
        let rolling = RollingMetrics::from_reports(&recent);
        let decision = self.policy.decide(entity, &recent, now);
        if let RetrainDecision::Retrain(signal) = &decision {
            self.store.raise_signal(signal).map_err(storage)?;
            tracing::warn!(
                entity,
                reason = signal.reason.as_str(),
                rolling_coverage = signal.rolling_coverage,
                rolling_mae = signal.rolling_mae,
                "Retrain signal raised"
            );
        }

        Ok(EvaluationOutcome {
            entity: entity.to_string(),
            reports,
            rolling,
            decision,
        })
    }

    pub fn lifecycle(&self, entity: &str) -> EngineResult<ModelLifecycle> {
        self.require_entity(entity)?;
        let Some(version) = self.registry.current_version(entity)? else {
            return Ok(ModelLifecycle::Untrained);
        };
        let retrain_pending = self.store.pending_signal(entity).map_err(storage)?.is_some();
        Ok(ModelLifecycle::Trained {
            version: version.to_string(),
            retrain_pending,
        })
    }

    /// Which configured entities a daily scheduler should train at `now`.
    pub fn plan_training(&self, now: DateTime<Utc>) -> EngineResult<Vec<PlannedTraining>> {
        let freshness = Duration::hours(self.config.retrain.data_freshness_hours);
        let mut plan = Vec::with_capacity(self.config.entities.len());
        for entity in &self.config.entities {
            let id = entity.id.as_str();
            let fresh = !self
                .source
                .fetch_observations(id, now - freshness, now)
                .map_err(|e| EngineError::Source(format!("{e:#}")))?
                .is_empty();
            let current = self.registry.current_version(id)?;
            let signal_pending = self.store.pending_signal(id).map_err(storage)?.is_some();
            let action = match current {
                _ if !fresh => PlanAction::Skip(SkipReason::NoFreshData),
                None => PlanAction::Train(TrainReason::NeverTrained),
                Some(_) if signal_pending => PlanAction::Train(TrainReason::RetrainSignal),
                Some(v) if v.timestamp().date_naive() < now.date_naive() => {
                    PlanAction::Train(TrainReason::StaleDailyVersion)
                }
                Some(_) => PlanAction::Skip(SkipReason::TrainedToday),
            };
            plan.push(PlannedTraining {
                entity: id.to_string(),
                action,
            });
        }
        Ok(plan)
    }

    /// Train `entities` in parallel, one blocking worker each. Every
    /// requested entity gets a result; a duplicate whose earlier run is
    /// still going reports `TrainingInProgress`.
    pub async fn train_many(
        self: &Arc<Self>,
        entities: Vec<String>,
        now: DateTime<Utc>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<(String, EngineResult<TrainOutcome>)> {
        let mut pool = TrainingPool::new();
        for entity in entities {
            let engine = Arc::clone(self);
            let shutdown = shutdown.clone();
            let id = entity.clone();
            pool.spawn(entity, move || engine.train(&id, now, &shutdown));
        }
        pool.join_all().await
    }

    /// Train every entity the plan marks for training.
    pub async fn train_planned(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        shutdown: watch::Receiver<bool>,
    ) -> EngineResult<Vec<(String, EngineResult<TrainOutcome>)>> {
        let entities = self
            .plan_training(now)?
            .into_iter()
            .filter(|p| matches!(p.action, PlanAction::Train(_)))
            .map(|p| p.entity)
            .collect();
        Ok(self.train_many(entities, now, shutdown).await)
    }

    /// `predict` bounded by `predict.timeout_ms`. A timeout is reported as
    /// an error, never as a stale forecast.
    pub async fn predict_with_timeout(
        self: &Arc<Self>,
        entity: &str,
        as_of: DateTime<Utc>,
    ) -> EngineResult<PredictionRecord> {
        let budget_ms = self.config.predict.timeout_ms;
        let engine = Arc::clone(self);
        let id = entity.to_string();
        let task = tokio::task::spawn_blocking(move || engine.predict(&id, as_of));
        match tokio::time::timeout(std::time::Duration::from_millis(budget_ms), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::WorkerFailed {
                entity: entity.to_string(),
                detail: e.to_string(),
            }),
            Err(_) => Err(EngineError::Timeout {
                entity: entity.to_string(),
                operation: "predict",
                budget_ms,
            }),
        }
    }
}
