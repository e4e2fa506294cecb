#![allow(dead_code)]

use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;

use aq_forecast::config::Config;
use aq_forecast::features::{FeatureTransformer, FEATURE_SET_VERSION};
use aq_forecast::model::entity::Entity;
use aq_forecast::model::observation::{Covariates, Observation};
use aq_forecast::nccqr::{NcCqrTrainer, TrainedModel};
use aq_forecast::registry::ModelSpec;
use aq_forecast::source::InMemoryObservationSource;
use aq_forecast::window::WindowLoader;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::sync::watch;

pub const BASELINE: f64 = 40.0;
pub const AMPLITUDE: f64 = 20.0;
pub const PERIOD_HOURS: f64 = 24.0;
pub const NOISE_STD: f64 = 2.0;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap()
}

pub fn hour(n: i64) -> DateTime<Utc> {
    t0() + Duration::hours(n)
}

/// Noise-free concentration of the synthetic process.
pub fn truth(ts: DateTime<Utc>) -> f64 {
    let h = (ts - t0()).num_hours() as f64;
    BASELINE + AMPLITUDE * (2.0 * PI * h / PERIOD_HOURS).sin()
}

pub fn observation(ts: DateTime<Utc>, concentration: f64) -> Observation {
    let h = (ts - t0()).num_hours() as f64;
    Observation {
        timestamp: ts,
        concentration,
        covariates: Covariates {
            temperature: 18.0 + 6.0 * (2.0 * PI * (h - 6.0) / 24.0).sin(),
            humidity: 65.0 - 10.0 * (2.0 * PI * h / 24.0).sin(),
            wind_speed: 3.0 + (2.0 * PI * h / 72.0).sin().abs(),
            wind_direction: (h * 7.5) % 360.0,
            pressure: 1012.0 + 2.0 * (2.0 * PI * h / 168.0).cos(),
        },
        valid: true,
    }
}

/// `hours` hourly observations from `start_hour`: sinusoid plus Gaussian noise.
pub fn sinusoid_series(start_hour: i64, hours: usize, seed: u64) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, NOISE_STD).unwrap();
    (0..hours as i64)
        .map(|k| {
            let ts = hour(start_hour + k);
            observation(ts, truth(ts) + noise.sample(&mut rng))
        })
        .collect()
}

pub fn clean_series(start_hour: i64, hours: usize) -> Vec<Observation> {
    (0..hours as i64)
        .map(|k| {
            let ts = hour(start_hour + k);
            observation(ts, truth(ts))
        })
        .collect()
}

pub fn random_start(rng: &mut StdRng, max_hour: i64) -> i64 {
    rng.gen_range(0..max_hour)
}

pub fn source_with(entity: &str, observations: Vec<Observation>) -> Arc<InMemoryObservationSource> {
    let source = Arc::new(InMemoryObservationSource::new());
    source.extend(entity, observations);
    source
}

/// Short window and few epochs for plumbing tests.
pub fn fast_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.engine.window_hours = 240;
    cfg.engine.horizon_hours = 24;
    cfg.training.epochs = 20;
    cfg.training.hidden_dim = 8;
    cfg.training.min_calibration_samples = 20;
    cfg.registry.root = dir.join("models");
    cfg.storage.database_path = dir.join("forecast.sqlite");
    cfg.entities = vec![Entity::new("alpha", "Alpha"), Entity::new("beta", "Beta")];
    cfg
}

/// Full 720-hour window with enough epochs to fit the sinusoid.
pub fn scenario_config(dir: &Path) -> Config {
    let mut cfg = fast_config(dir);
    cfg.engine.window_hours = 720;
    cfg.training.epochs = 150;
    cfg.training.learning_rate = 3e-3;
    cfg.training.hidden_dim = 16;
    cfg.training.min_calibration_samples = 30;
    cfg
}

pub fn trainer_for(cfg: &Config) -> NcCqrTrainer {
    NcCqrTrainer::new(
        &cfg.engine,
        cfg.quantile,
        cfg.training,
        FeatureTransformer::new(cfg.engine.rolling_window),
    )
}

/// Train once on a synthetic window ending at `end_hour`.
pub fn train_on(cfg: &Config, entity: &str, end_hour: i64, seed: u64) -> TrainedModel {
    let hours = (end_hour + 1) as usize;
    let source = source_with(entity, sinusoid_series(0, hours, seed));
    let window = WindowLoader::new(source, &cfg.engine, cfg.quality)
        .load(entity, hour(end_hour))
        .unwrap();
    let (_tx, rx) = watch::channel(false);
    trainer_for(cfg).train(&window, seed, &rx).unwrap()
}

pub fn model_spec(cfg: &Config) -> ModelSpec {
    ModelSpec {
        feature_set_version: FEATURE_SET_VERSION,
        window_hours: cfg.engine.window_hours,
        horizon_hours: cfg.engine.horizon_hours,
        rolling_window: cfg.engine.rolling_window,
        tau_lo: cfg.quantile.tau_lo,
        tau_hi: cfg.quantile.tau_hi,
    }
}
