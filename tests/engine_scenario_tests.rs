mod common;

use std::sync::Arc;

use aq_forecast::config::Config;
use aq_forecast::engine::{ForecastEngine, ModelLifecycle, PlanAction, SkipReason, TrainReason};
use aq_forecast::error::EngineError;
use aq_forecast::evaluator::{RetrainDecision, RetrainReason};
use aq_forecast::model::observation::Observation;
use aq_forecast::source::{InMemoryObservationSource, ObservationSource};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use common::{fast_config, hour, scenario_config, sinusoid_series, source_with, truth};

type Engine = ForecastEngine<Arc<InMemoryObservationSource>>;

/// Source that answers every query after a fixed delay.
#[derive(Clone)]
struct SlowSource {
    inner: Arc<InMemoryObservationSource>,
    delay: std::time::Duration,
}

impl ObservationSource for SlowSource {
    fn fetch_observations(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Observation>> {
        std::thread::sleep(self.delay);
        self.inner.fetch_observations(entity_id, start, end)
    }
}

fn engine(cfg: Config, source: &Arc<InMemoryObservationSource>) -> Engine {
    ForecastEngine::new(cfg, Arc::clone(source)).expect("engine should start")
}

fn running() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

#[test]
/// End-to-end scenario on a 720-hour sinusoid-plus-noise history: the point
/// forecast tracks the noise-free signal within half a noise standard
/// deviation, and intervals cover at least 85% of a 500-hour held-out stream.
fn scenario_sinusoid_accuracy_and_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = scenario_config(dir.path());
    cfg.training.epochs = 300;
    let held_out = 500;
    let total = 720 + held_out + 24;
    let source = source_with("alpha", sinusoid_series(0, total, 2024));
    let engine = engine(cfg, &source);

    let outcome = engine
        .train("alpha", hour(719), &running())
        .expect("train should succeed");
    assert_eq!(outcome.window_end, hour(719));
    assert!(outcome.summary.calibration_miss_rate <= 0.1);

    let actual = sinusoid_series(0, total, 2024);
    let mut abs_err = 0.0;
    let mut covered = 0usize;
    let mut n = 0usize;
    for k in 0..held_out as i64 {
        let record = engine
            .predictor()
            .predict("alpha", hour(719 + k))
            .expect("predict should succeed");
        for step in &record.steps {
            let idx = (step.target_time - hour(0)).num_hours() as usize;
            abs_err += (step.point - truth(step.target_time)).abs();
            if step.covers(actual[idx].concentration) {
                covered += 1;
            }
            n += 1;
        }
    }
    let mae = abs_err / n as f64;
    let coverage = covered as f64 / n as f64;
    assert!(mae < 0.5 * common::NOISE_STD, "mae {mae}");
    assert!(coverage >= 0.85, "coverage {coverage}");
}

#[test]
fn unknown_entity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_with("alpha", sinusoid_series(0, 300, 1));
    let engine = engine(fast_config(dir.path()), &source);

    assert!(matches!(
        engine.train("gamma", hour(239), &running()),
        Err(EngineError::UnknownEntity(_))
    ));
    assert!(matches!(
        engine.predict("gamma", hour(239)),
        Err(EngineError::UnknownEntity(_))
    ));
    assert!(matches!(
        engine.evaluate("gamma", hour(239)),
        Err(EngineError::UnknownEntity(_))
    ));
}

#[test]
/// Verifies the retrain loop: degraded accuracy after a level shift raises a
/// signal, the plan picks it up, and the next successful train consumes it.
fn evaluation_raises_signal_consumed_by_next_train() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_with("alpha", sinusoid_series(0, 244, 1));
    let mut shifted = sinusoid_series(244, 56, 2);
    for obs in shifted.iter_mut() {
        obs.concentration += 150.0;
    }
    source.extend("alpha", shifted);
    let engine = engine(fast_config(dir.path()), &source);

    assert_eq!(engine.lifecycle("alpha").unwrap(), ModelLifecycle::Untrained);
    let first = engine.train("alpha", hour(239), &running()).unwrap();
    assert!(first.consumed_signal.is_none());

    // Input windows end before the shift; most targets fall after it.
    for k in 0..4 {
        engine.predict("alpha", hour(239 + k)).expect("predict should succeed");
    }
    engine.predict("alpha", hour(239)).unwrap();
    assert_eq!(engine.store().prediction_count("alpha").unwrap(), 4);

    let outcome = engine.evaluate("alpha", hour(299)).expect("evaluate should succeed");
    assert_eq!(outcome.reports.len(), 4);
    assert_eq!(outcome.rolling.reports, 4);
    assert!(outcome.rolling.coverage < 0.85);
    match &outcome.decision {
        RetrainDecision::Retrain(signal) => {
            assert_eq!(signal.reason, RetrainReason::CoverageBelowFloor);
            assert_eq!(signal.version, first.version);
        }
        RetrainDecision::Keep => panic!("expected a retrain signal"),
    }
    assert_eq!(
        engine.lifecycle("alpha").unwrap(),
        ModelLifecycle::Trained {
            version: first.version.clone(),
            retrain_pending: true,
        }
    );

    let again = engine.evaluate("alpha", hour(299)).unwrap();
    assert!(again.reports.is_empty());

    let plan = engine.plan_training(hour(299)).unwrap();
    let alpha = plan.iter().find(|p| p.entity == "alpha").unwrap();
    assert_eq!(alpha.action, PlanAction::Train(TrainReason::RetrainSignal));

    let second = engine.train("alpha", hour(299), &running()).unwrap();
    let consumed = second.consumed_signal.expect("signal should be consumed");
    assert_eq!(consumed.version, first.version);
    assert_eq!(
        engine.lifecycle("alpha").unwrap(),
        ModelLifecycle::Trained {
            version: second.version,
            retrain_pending: false,
        }
    );
}

#[test]
/// Verifies that predictions whose actuals never arrive leave the pending
/// queue after the expiry grace instead of being re-fetched forever.
fn evaluation_closes_predictions_without_actuals() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_with("alpha", sinusoid_series(0, 240, 1));
    let engine = engine(fast_config(dir.path()), &source);
    engine.train("alpha", hour(239), &running()).unwrap();
    engine.predict("alpha", hour(239)).unwrap();

    for _ in 0..3 {
        let outcome = engine.evaluate("alpha", hour(270)).unwrap();
        assert!(outcome.reports.is_empty());
        assert_eq!(engine.store().pending_evaluations("alpha", hour(270)).unwrap().len(), 1);
    }

    // Horizon ends at hour 263; the default grace is 24 hours.
    let outcome = engine.evaluate("alpha", hour(287)).unwrap();
    assert_eq!(outcome.reports.len(), 1);
    assert_eq!(outcome.reports[0].sample_count, 0);
    assert_eq!(outcome.decision, RetrainDecision::Keep);
    assert!(engine.store().pending_evaluations("alpha", hour(300)).unwrap().is_empty());
    assert!(engine.evaluate("alpha", hour(300)).unwrap().reports.is_empty());
}

#[test]
/// Verifies the daily plan: never-trained entities train, entities without
/// recent data are skipped, and a version from today is not retrained.
fn plan_training_classifies_entities() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_with("alpha", sinusoid_series(0, 300, 1));
    let engine = engine(fast_config(dir.path()), &source);

    let plan = engine.plan_training(hour(239)).unwrap();
    assert_eq!(plan.len(), 2);
    assert_eq!(plan[0].entity, "alpha");
    assert_eq!(plan[0].action, PlanAction::Train(TrainReason::NeverTrained));
    assert_eq!(plan[1].entity, "beta");
    assert_eq!(plan[1].action, PlanAction::Skip(SkipReason::NoFreshData));

    engine.train("alpha", hour(239), &running()).unwrap();
    let same_day = engine.plan_training(hour(239) + Duration::minutes(30)).unwrap();
    assert_eq!(same_day[0].action, PlanAction::Skip(SkipReason::TrainedToday));

    let next_day = engine.plan_training(hour(260)).unwrap();
    assert_eq!(next_day[0].action, PlanAction::Train(TrainReason::StaleDailyVersion));
}

#[test]
/// Verifies that failed or cancelled runs leave the serving version alone.
fn failed_training_keeps_previous_version() {
    let dir = tempfile::tempdir().unwrap();
    let mut series = sinusoid_series(0, 300, 1);
    series.retain(|o| !(260..265).contains(&(o.timestamp - hour(0)).num_hours()));
    let source = source_with("alpha", series);
    let engine = engine(fast_config(dir.path()), &source);

    let first = engine.train("alpha", hour(239), &running()).unwrap();

    let err = engine.train("alpha", hour(280), &running()).unwrap_err();
    assert!(matches!(err, EngineError::IrreparableGap { .. }));
    assert!(err.is_retryable());

    let (_tx, cancelled) = watch::channel(true);
    assert!(matches!(
        engine.train("alpha", hour(250), &cancelled),
        Err(EngineError::Cancelled { .. })
    ));

    let current = engine.registry().current_version("alpha").unwrap().unwrap();
    assert_eq!(current.to_string(), first.version);
    assert_eq!(engine.registry().versions("alpha").unwrap().len(), 1);
}

#[tokio::test]
async fn train_many_isolates_entity_failures() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_with("alpha", sinusoid_series(0, 240, 1));
    let engine = Arc::new(engine(fast_config(dir.path()), &source));

    let results = engine
        .train_many(vec!["beta".to_string(), "alpha".to_string()], hour(239), running())
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "alpha");
    assert!(results[0].1.is_ok());
    assert_eq!(results[1].0, "beta");
    assert!(matches!(
        results[1].1,
        Err(EngineError::DataInsufficient { .. })
    ));
    assert!(engine.registry().current_version("alpha").unwrap().is_some());
    assert!(engine.registry().current_version("beta").unwrap().is_none());
}

#[tokio::test]
/// Verifies that a duplicated entity is reported rather than dropped.
async fn train_many_reports_every_request() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_with("alpha", sinusoid_series(0, 240, 1));
    let engine = Arc::new(engine(fast_config(dir.path()), &source));

    let results = engine
        .train_many(vec!["alpha".to_string(), "alpha".to_string()], hour(239), running())
        .await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(entity, _)| entity == "alpha"));
    assert!(results[0].1.is_ok());
    match &results[1].1 {
        Ok(_) | Err(EngineError::TrainingInProgress { .. }) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn train_planned_trains_only_selected_entities() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_with("alpha", sinusoid_series(0, 240, 1));
    let engine = Arc::new(engine(fast_config(dir.path()), &source));

    let results = engine
        .train_planned(hour(239), running())
        .await
        .expect("plan should succeed");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "alpha");
    assert!(results[0].1.is_ok());
}

#[tokio::test]
/// Verifies the inference budget: a served prediction within budget is
/// returned, and an exhausted budget is an error rather than a stale value.
async fn predict_with_timeout_honours_budget() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_with("alpha", sinusoid_series(0, 300, 1));
    let engine = Arc::new(engine(fast_config(dir.path()), &source));
    engine.train("alpha", hour(239), &running()).unwrap();

    let record = engine
        .predict_with_timeout("alpha", hour(250))
        .await
        .expect("predict should succeed");
    assert_eq!(record.generated_at, hour(250));

    let mut cfg = fast_config(dir.path());
    cfg.predict.timeout_ms = 20;
    let slow = SlowSource {
        inner: Arc::clone(&source),
        delay: std::time::Duration::from_millis(300),
    };
    let strict = Arc::new(ForecastEngine::new(cfg, slow).unwrap());
    match strict.predict_with_timeout("alpha", hour(251)).await {
        Err(EngineError::Timeout { operation, budget_ms, .. }) => {
            assert_eq!(operation, "predict");
            assert_eq!(budget_ms, 20);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
