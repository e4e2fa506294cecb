use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::model::entity::Entity;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub quantile: QuantileConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub retrain: RetrainConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub predict: PredictConfig,
    #[serde(default)]
    pub quality: QualityBounds,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Window and horizon geometry shared by every entity.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EngineConfig {
    /// Hours of history in one input window.
    pub window_hours: usize,
    /// Hours forecast per prediction.
    pub horizon_hours: usize,
    /// Longest run of missing hours that is repaired instead of rejected.
    pub max_gap_hours: usize,
    /// Length of the rolling mean/std features on the target.
    pub rolling_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_hours: 720,
            horizon_hours: 24,
            max_gap_hours: 2,
            rolling_window: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OffsetMode {
    /// One conformal offset per horizon step.
    #[default]
    PerStep,
    /// A single offset pooled over every step.
    Scalar,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QuantileConfig {
    pub tau_lo: f64,
    pub tau_hi: f64,
    /// Miscoverage rate; intervals target `1 - alpha` coverage.
    pub alpha: f64,
    #[serde(default)]
    pub offset_mode: OffsetMode,
}

impl Default for QuantileConfig {
    fn default() -> Self {
        Self {
            tau_lo: 0.05,
            tau_hi: 0.95,
            alpha: 0.10,
            offset_mode: OffsetMode::PerStep,
        }
    }
}

impl QuantileConfig {
    pub fn target_coverage(&self) -> f64 {
        1.0 - self.alpha
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub hidden_dim: usize,
    /// Trailing share of training origins held out for calibration.
    pub calibration_fraction: f64,
    pub min_calibration_samples: usize,
    /// Weight of the low > high crossing penalty.
    pub crossing_penalty: f64,
    /// Rescale the crossing penalty between epochs from the observed crossing rate.
    #[serde(default)]
    pub adaptive_penalty: bool,
    pub base_seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 150,
            learning_rate: 4e-3,
            batch_size: 32,
            hidden_dim: 32,
            calibration_fraction: 0.2,
            min_calibration_samples: 30,
            crossing_penalty: 1.0,
            adaptive_penalty: false,
            base_seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetrainConfig {
    /// Rolling empirical coverage below this raises a retrain signal.
    pub coverage_floor: f64,
    /// Rolling MAE (physical units) above this raises a retrain signal.
    pub mae_ceiling: f64,
    /// Number of most recent evaluation reports in the rolling window.
    pub evaluation_window: usize,
    /// Reports required before the policy may raise a signal.
    pub min_reports: usize,
    /// Training is skipped when the newest observation is older than this.
    pub data_freshness_hours: i64,
    /// Hours after the horizon ends before a prediction with no usable
    /// actuals is closed with an empty report.
    #[serde(default = "default_evaluation_grace_hours")]
    pub evaluation_grace_hours: i64,
}

fn default_evaluation_grace_hours() -> i64 {
    24
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            coverage_floor: 0.85,
            mae_ceiling: 15.0,
            evaluation_window: 7,
            min_reports: 3,
            data_freshness_hours: 72,
            evaluation_grace_hours: default_evaluation_grace_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub root: PathBuf,
    pub retention_days: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/models"),
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/aq_forecast.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PredictConfig {
    pub timeout_ms: u64,
    /// Floor point forecasts and lower bounds at zero concentration.
    pub clamp_non_negative: bool,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            clamp_non_negative: true,
        }
    }
}

/// Closed physical range for one measured field.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, v: f64) -> bool {
        v.is_finite() && v >= self.min && v <= self.max
    }
}

/// Plausibility bounds; an observation outside any of them counts as a missing hour.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QualityBounds {
    pub concentration: Range,
    pub temperature: Range,
    pub humidity: Range,
    pub wind_speed: Range,
    pub wind_direction: Range,
    pub pressure: Range,
}

impl Default for QualityBounds {
    fn default() -> Self {
        Self {
            concentration: Range::new(0.0, 500.0),
            temperature: Range::new(-30.0, 50.0),
            humidity: Range::new(0.0, 100.0),
            wind_speed: Range::new(0.0, 200.0),
            wind_direction: Range::new(0.0, 360.0),
            pressure: Range::new(800.0, 1200.0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn config_path() -> PathBuf {
    std::env::var("AQ_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/default.toml"))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_from_path(&config_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.horizon_hours == 0 || e.window_hours == 0 {
            bail!("engine.window_hours and engine.horizon_hours must be > 0");
        }
        if e.horizon_hours + e.rolling_window >= e.window_hours {
            bail!(
                "engine.window_hours ({}) must exceed horizon_hours + rolling_window ({})",
                e.window_hours,
                e.horizon_hours + e.rolling_window
            );
        }
        if e.rolling_window < 2 {
            bail!("engine.rolling_window must be >= 2");
        }

        let q = &self.quantile;
        if !(0.0 < q.tau_lo && q.tau_lo < q.tau_hi && q.tau_hi < 1.0) {
            bail!(
                "quantile levels must satisfy 0 < tau_lo < tau_hi < 1, got {} / {}",
                q.tau_lo,
                q.tau_hi
            );
        }
        if !(0.0 < q.alpha && q.alpha < 1.0) {
            bail!("quantile.alpha must be in (0, 1), got {}", q.alpha);
        }

        let t = &self.training;
        if t.epochs == 0 || t.batch_size == 0 || t.hidden_dim == 0 {
            bail!("training.epochs, batch_size and hidden_dim must be > 0");
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            bail!("training.learning_rate must be a positive number");
        }
        if !(0.0 < t.calibration_fraction && t.calibration_fraction < 1.0) {
            bail!(
                "training.calibration_fraction must be in (0, 1), got {}",
                t.calibration_fraction
            );
        }
        if t.crossing_penalty < 0.0 {
            bail!("training.crossing_penalty must be >= 0");
        }

        let r = &self.retrain;
        if !(0.0..=1.0).contains(&r.coverage_floor) {
            bail!("retrain.coverage_floor must be in [0, 1]");
        }
        if r.evaluation_window == 0 {
            bail!("retrain.evaluation_window must be > 0");
        }
        if r.evaluation_grace_hours < 0 {
            bail!("retrain.evaluation_grace_hours must be >= 0");
        }
        if self.registry.retention_days < 1 {
            bail!("registry.retention_days must be >= 1");
        }

        let mut seen = std::collections::HashSet::new();
        for entity in &self.entities {
            if entity.id.is_empty()
                || !entity
                    .id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                bail!(
                    "entity id '{}' must be non-empty and use only [A-Za-z0-9_-]",
                    entity.id
                );
            }
            if !seen.insert(entity.id.as_str()) {
                bail!("duplicate entity id '{}'", entity.id);
            }
        }
        Ok(())
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }
}
