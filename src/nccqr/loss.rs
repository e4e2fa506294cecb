use serde::{Deserialize, Serialize};

/// Mean loss components over the examples and horizon steps of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub total: f64,
    pub point: f64,
    pub pinball_low: f64,
    pub pinball_high: f64,
    /// Mean `relu(low - high)` before weighting by the penalty.
    pub crossing: f64,
    /// Share of (example, step) pairs where low exceeded high.
    pub crossing_rate: f64,
}

impl LossBreakdown {
    pub fn add(&mut self, other: &LossBreakdown) {
        self.total += other.total;
        self.point += other.point;
        self.pinball_low += other.pinball_low;
        self.pinball_high += other.pinball_high;
        self.crossing += other.crossing;
        self.crossing_rate += other.crossing_rate;
    }

    pub fn scaled(&self, factor: f64) -> LossBreakdown {
        LossBreakdown {
            total: self.total * factor,
            point: self.point * factor,
            pinball_low: self.pinball_low * factor,
            pinball_high: self.pinball_high * factor,
            crossing: self.crossing * factor,
            crossing_rate: self.crossing_rate * factor,
        }
    }
}

pub fn pinball(actual: f64, quantile: f64, tau: f64) -> f64 {
    let e = actual - quantile;
    if e >= 0.0 {
        tau * e
    } else {
        (tau - 1.0) * e
    }
}

/// d pinball / d quantile.
pub fn pinball_grad(actual: f64, quantile: f64, tau: f64) -> f64 {
    let e = actual - quantile;
    if e > 0.0 {
        -tau
    } else if e < 0.0 {
        1.0 - tau
    } else {
        0.0
    }
}

/// Squared error on the point head, pinball loss on each quantile head and
/// `penalty * relu(low - high)` per horizon step.
#[derive(Debug, Clone, Copy)]
pub struct NonCrossingLoss {
    pub tau_low: f64,
    pub tau_high: f64,
    pub penalty: f64,
}

impl NonCrossingLoss {
    /// Add one example's loss, scaled by `weight`, to `acc` and its output
    /// gradient to `d_out`. `output` is `[point | low | high]`.
    pub fn accumulate(
        &self,
        output: &[f64],
        targets: &[f64],
        weight: f64,
        d_out: &mut [f64],
        acc: &mut LossBreakdown,
    ) {
        let horizon = targets.len();
        for (h, y) in targets.iter().copied().enumerate() {
            let point = output[h];
            let low = output[horizon + h];
            let high = output[2 * horizon + h];

            let err = point - y;
            acc.point += weight * err * err;
            d_out[h] += weight * 2.0 * err;

            acc.pinball_low += weight * pinball(y, low, self.tau_low);
            d_out[horizon + h] += weight * pinball_grad(y, low, self.tau_low);
            acc.pinball_high += weight * pinball(y, high, self.tau_high);
            d_out[2 * horizon + h] += weight * pinball_grad(y, high, self.tau_high);

            let violation = low - high;
            if violation > 0.0 {
                acc.crossing += weight * violation;
                acc.crossing_rate += weight;
                d_out[horizon + h] += weight * self.penalty;
                d_out[2 * horizon + h] -= weight * self.penalty;
            }
        }
        acc.total = acc.point + acc.pinball_low + acc.pinball_high + self.penalty * acc.crossing;
    }
}

/// Update of the penalty weight between epochs, driven by the epoch's mean
/// crossing magnitude (not the share of crossed pairs).
pub fn adapt_penalty(penalty: f64, epoch: &LossBreakdown) -> f64 {
    if epoch.crossing > 0.2 {
        penalty * 1.5
    } else if epoch.crossing < 0.01 {
        (penalty * 0.9).max(0.1)
    } else {
        penalty
    }
}
