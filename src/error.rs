use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("insufficient data for {entity}: need {expected} hourly observations ending {end}, {detail}")]
    DataInsufficient {
        entity: String,
        expected: usize,
        end: DateTime<Utc>,
        detail: String,
    },

    #[error("irreparable gap for {entity}: {missing_hours} consecutive hours missing after {gap_start} (tolerance {tolerance})")]
    IrreparableGap {
        entity: String,
        gap_start: DateTime<Utc>,
        missing_hours: usize,
        tolerance: usize,
    },

    #[error("scaler feature-set version {found} does not match transformer version {expected}")]
    ScalerMismatch { expected: u32, found: u32 },

    #[error("training diverged at epoch {epoch}: loss is not finite")]
    TrainingDiverged { epoch: usize },

    #[error("calibration split has {available} examples, need at least {required}")]
    InsufficientCalibrationData { available: usize, required: usize },

    #[error("version {version} of {entity} produced an invalid interval at step {step}: {detail}")]
    InvalidForecast {
        entity: String,
        version: String,
        step: usize,
        detail: String,
    },

    #[error("no current model version for {entity}; train it first")]
    StaleModel { entity: String },

    #[error("training for {entity} cancelled before epoch {epoch}")]
    Cancelled { entity: String, epoch: usize },

    #[error("{operation} for {entity} exceeded {budget_ms} ms")]
    Timeout {
        entity: String,
        operation: &'static str,
        budget_ms: u64,
    },

    #[error("version {version} already exists for {entity}")]
    VersionExists { entity: String, version: String },

    #[error("refusing to move current version of {entity} from {current} back to {requested}")]
    VersionRegression {
        entity: String,
        current: String,
        requested: String,
    },

    #[error("training for {entity} is already running")]
    TrainingInProgress { entity: String },

    #[error("worker for {entity} failed: {detail}")]
    WorkerFailed { entity: String, detail: String },

    #[error("observation source error: {0}")]
    Source(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl EngineError {
    /// Data-quality and transient failures a scheduler may retry later
    /// without human intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::DataInsufficient { .. }
                | EngineError::IrreparableGap { .. }
                | EngineError::Source(_)
                | EngineError::Timeout { .. }
                | EngineError::Cancelled { .. }
                | EngineError::TrainingInProgress { .. }
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
