use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::calibration::{calibrate, CalibrationSet, ConformalOffset};
use super::loss::{adapt_penalty, LossBreakdown, NonCrossingLoss};
use super::network::{Adam, QuantileNetwork};
use crate::config::{EngineConfig, QuantileConfig, TrainingConfig};
use crate::error::{EngineError, EngineResult};
use crate::features::{FeatureMatrix, FeatureTransformer, Scaler};
use crate::reproducibility::seeded_rng;
use crate::window::Window;

const EPOCH_LOG_INTERVAL: usize = 50;
const MIN_TRAIN_EXAMPLES: usize = 2;

/// Origin ranges of the proper-training and calibration splits.
///
/// Origin `r` uses features at matrix row `r` and targets at rows
/// `r+1..=r+H`. Calibration origins are the trailing `calibration_len`
/// origins; the `H-1` origins before them are dropped so no training target
/// is also a calibration target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    pub n_examples: usize,
    pub train_end: usize,
    pub calibration_start: usize,
}

impl SplitPlan {
    pub fn train_len(&self) -> usize {
        self.train_end
    }

    pub fn calibration_len(&self) -> usize {
        self.n_examples - self.calibration_start
    }

    /// Leading matrix rows visible to training; the scaler is fitted on these only.
    pub fn fit_rows(&self) -> usize {
        self.calibration_start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub seed: u64,
    pub epochs_run: usize,
    pub final_loss: LossBreakdown,
    /// Penalty weight after the last epoch (differs from the configured one
    /// only with adaptive penalties).
    pub crossing_penalty: f64,
    pub train_examples: usize,
    pub calibration_examples: usize,
    /// Share of calibration (example, step) pairs with raw low > high.
    pub raw_crossing_rate: f64,
    /// Share of calibration targets outside the conformalized interval.
    pub calibration_miss_rate: f64,
    pub mean_interval_width: f64,
}

/// Everything a training run produces. Nothing here is persisted until the
/// caller hands it to the registry.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub network: QuantileNetwork,
    pub offset: ConformalOffset,
    pub scaler: Scaler,
    pub summary: TrainingSummary,
}

#[derive(Debug, Clone)]
pub struct NcCqrTrainer {
    horizon: usize,
    quantile: QuantileConfig,
    training: TrainingConfig,
    transformer: FeatureTransformer,
}

impl NcCqrTrainer {
    pub fn new(
        engine: &EngineConfig,
        quantile: QuantileConfig,
        training: TrainingConfig,
        transformer: FeatureTransformer,
    ) -> Self {
        Self {
            horizon: engine.horizon_hours,
            quantile,
            training,
            transformer,
        }
    }

    pub fn transformer(&self) -> &FeatureTransformer {
        &self.transformer
    }

    pub fn plan(&self, window: &Window) -> EngineResult<SplitPlan> {
        let rows = self.transformer.rows_for(window.len());
        let insufficient = |detail: String| EngineError::DataInsufficient {
            entity: window.entity.clone(),
            expected: window.len(),
            end: window.end,
            detail,
        };
        if rows <= self.horizon {
            return Err(insufficient(format!(
                "{rows} feature rows cannot cover a {}-hour horizon",
                self.horizon
            )));
        }
        let n_examples = rows - self.horizon;
        let n_calib = (self.training.calibration_fraction * n_examples as f64).round() as usize;
        if n_calib < self.training.min_calibration_samples || n_calib == 0 {
            return Err(EngineError::InsufficientCalibrationData {
                available: n_calib,
                required: self.training.min_calibration_samples.max(1),
            });
        }
        let calibration_start = n_examples - n_calib;
        let train_end = (calibration_start + 1).saturating_sub(self.horizon);
        if train_end < MIN_TRAIN_EXAMPLES {
            return Err(insufficient(format!(
                "only {train_end} training origins remain after the calibration split"
            )));
        }
        Ok(SplitPlan {
            n_examples,
            train_end,
            calibration_start,
        })
    }

    /// Fit the network on the training split and calibrate offsets on the
    /// held-out split. Aborts between epochs once `shutdown` reads `true`.
    pub fn train(
        &self,
        window: &Window,
        seed: u64,
        shutdown: &watch::Receiver<bool>,
    ) -> EngineResult<TrainedModel> {
        let plan = self.plan(window)?;
        let (matrix, scaler) = self.transformer.fit(window, plan.fit_rows())?;
        let mut rng = seeded_rng(seed);
        let mut network = QuantileNetwork::new(
            matrix.n_features(),
            self.training.hidden_dim,
            self.horizon,
            &mut rng,
        );

        let (final_loss, penalty) =
            self.fit_network(&window.entity, &matrix, &plan, &mut network, &mut rng, shutdown)?;
        let (offset, diagnostics) = self.calibrate(&matrix, &scaler, &plan, &network)?;

        let summary = TrainingSummary {
            seed,
            epochs_run: self.training.epochs,
            final_loss,
            crossing_penalty: penalty,
            train_examples: plan.train_len(),
            calibration_examples: plan.calibration_len(),
            raw_crossing_rate: diagnostics.raw_crossing_rate,
            calibration_miss_rate: diagnostics.miss_rate,
            mean_interval_width: diagnostics.mean_width,
        };
        tracing::info!(
            entity = %window.entity,
            seed,
            train_examples = summary.train_examples,
            calibration_examples = summary.calibration_examples,
            raw_crossing_rate = summary.raw_crossing_rate,
            calibration_miss_rate = summary.calibration_miss_rate,
            mean_interval_width = summary.mean_interval_width,
            "Calibrated conformal offsets"
        );

        Ok(TrainedModel {
            network,
            offset,
            scaler,
            summary,
        })
    }

    fn fit_network(
        &self,
        entity: &str,
        matrix: &FeatureMatrix,
        plan: &SplitPlan,
        network: &mut QuantileNetwork,
        rng: &mut StdRng,
        shutdown: &watch::Receiver<bool>,
    ) -> EngineResult<(LossBreakdown, f64)> {
        let horizon = self.horizon;
        let mut loss = NonCrossingLoss {
            tau_low: self.quantile.tau_lo,
            tau_high: self.quantile.tau_hi,
            penalty: self.training.crossing_penalty,
        };
        let mut adam = Adam::new(network.param_count(), self.training.learning_rate);
        let mut grad = vec![0.0; network.param_count()];
        let mut d_out = vec![0.0; network.output_dim()];
        let mut order: Vec<usize> = (0..plan.train_end).collect();
        let mut last = LossBreakdown::default();

        for epoch in 0..self.training.epochs {
            if *shutdown.borrow() {
                return Err(EngineError::Cancelled {
                    entity: entity.to_string(),
                    epoch,
                });
            }
            order.shuffle(rng);

            let mut epoch_loss = LossBreakdown::default();
            let mut batches = 0usize;
            for batch in order.chunks(self.training.batch_size) {
                if batch.len() < 2 {
                    continue;
                }
                grad.iter_mut().for_each(|g| *g = 0.0);
                let weight = 1.0 / (batch.len() * horizon) as f64;
                let mut batch_loss = LossBreakdown::default();
                for &r in batch {
                    let x = &matrix.rows[r];
                    let targets = &matrix.target[r + 1..=r + horizon];
                    let act = network.forward_cached(x);
                    d_out.iter_mut().for_each(|d| *d = 0.0);
                    loss.accumulate(&act.output, targets, weight, &mut d_out, &mut batch_loss);
                    network.backward(x, &act, &d_out, &mut grad);
                }
                if !batch_loss.total.is_finite() {
                    return Err(EngineError::TrainingDiverged { epoch });
                }
                adam.step(&mut network.params, &grad);
                epoch_loss.add(&batch_loss);
                batches += 1;
            }

            last = epoch_loss.scaled(1.0 / batches.max(1) as f64);
            if !last.total.is_finite() || network.params.iter().any(|p| !p.is_finite()) {
                return Err(EngineError::TrainingDiverged { epoch });
            }
            if epoch == 0 || (epoch + 1) % EPOCH_LOG_INTERVAL == 0 || epoch + 1 == self.training.epochs {
                tracing::debug!(
                    entity,
                    epoch = epoch + 1,
                    total = last.total,
                    point = last.point,
                    pinball_low = last.pinball_low,
                    pinball_high = last.pinball_high,
                    crossing_rate = last.crossing_rate,
                    penalty = loss.penalty,
                    "Training epoch"
                );
            }
            if self.training.adaptive_penalty {
                loss.penalty = adapt_penalty(loss.penalty, &last);
            }
        }
        Ok((last, loss.penalty))
    }

    fn calibrate(
        &self,
        matrix: &FeatureMatrix,
        scaler: &Scaler,
        plan: &SplitPlan,
        network: &QuantileNetwork,
    ) -> EngineResult<(ConformalOffset, CalibrationDiagnostics)> {
        let horizon = self.horizon;
        let mut low = Vec::with_capacity(plan.calibration_len());
        let mut high = Vec::with_capacity(plan.calibration_len());
        let mut actual = Vec::with_capacity(plan.calibration_len());
        let mut crossings = 0usize;

        for c in plan.calibration_start..plan.n_examples {
            let out = network.forward(&matrix.rows[c]);
            crossings += out
                .low
                .iter()
                .zip(&out.high)
                .filter(|(l, h)| l > h)
                .count();
            low.push(out.low.iter().map(|v| scaler.inverse_target(*v)).collect::<Vec<_>>());
            high.push(out.high.iter().map(|v| scaler.inverse_target(*v)).collect::<Vec<_>>());
            actual.push(matrix.raw_target[c + 1..=c + horizon].to_vec());
        }

        let set = CalibrationSet {
            low: &low,
            high: &high,
            actual: &actual,
        };
        let offset = calibrate(
            &set,
            horizon,
            self.quantile.alpha,
            self.quantile.offset_mode,
            self.training.min_calibration_samples,
        )?;

        let pairs = (low.len() * horizon).max(1) as f64;
        let mut misses = 0usize;
        let mut width = 0.0;
        for i in 0..low.len() {
            for h in 0..horizon {
                let (lo, hi) = offset.apply(h, low[i][h], high[i][h]);
                if actual[i][h] < lo || actual[i][h] > hi {
                    misses += 1;
                }
                width += hi - lo;
            }
        }
        Ok((
            offset,
            CalibrationDiagnostics {
                raw_crossing_rate: crossings as f64 / pairs,
                miss_rate: misses as f64 / pairs,
                mean_width: width / pairs,
            },
        ))
    }
}

struct CalibrationDiagnostics {
    raw_crossing_rate: f64,
    miss_rate: f64,
    mean_width: f64,
}
