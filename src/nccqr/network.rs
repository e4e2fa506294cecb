use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// One hidden ReLU layer plus a linear skip path from input to output.
///
/// Raw outputs are laid out as `[point(H) | low(H) | width(H)]` and the high
/// head is `low + softplus(width)`, so `low <= high` holds for every input.
/// All parameters live in one flat vector:
/// `[w1 (hidden*input) | b1 (hidden) | w2 (out*hidden) | skip (out*input) | b2 (out)]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileNetwork {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub horizon: usize,
    pub params: Vec<f64>,
}

/// Per-head trajectories in scaled target units.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutput {
    pub point: Vec<f64>,
    pub low: Vec<f64>,
    pub high: Vec<f64>,
}

pub struct Activations {
    hidden: Vec<f64>,
    raw: Vec<f64>,
    /// Head values `[point | low | high]`.
    pub output: Vec<f64>,
}

impl QuantileNetwork {
    pub fn new(input_dim: usize, hidden_dim: usize, horizon: usize, rng: &mut StdRng) -> Self {
        let mut net = Self {
            input_dim,
            hidden_dim,
            horizon,
            params: Vec::new(),
        };
        let total = net.skip_offset() + net.output_dim() * input_dim + net.output_dim();
        net.params = vec![0.0; total];

        let he = (2.0 / input_dim as f64).sqrt();
        for w in &mut net.params[..hidden_dim * input_dim] {
            *w = rng.sample::<f64, _>(StandardNormal) * he;
        }
        let w2 = net.w2_offset();
        let w2_end = net.skip_offset();
        let out_std = 0.1 / (hidden_dim as f64).sqrt();
        for w in &mut net.params[w2..w2_end] {
            *w = rng.sample::<f64, _>(StandardNormal) * out_std;
        }
        net
    }

    pub fn output_dim(&self) -> usize {
        3 * self.horizon
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    fn b1_offset(&self) -> usize {
        self.hidden_dim * self.input_dim
    }

    fn w2_offset(&self) -> usize {
        self.b1_offset() + self.hidden_dim
    }

    fn skip_offset(&self) -> usize {
        self.w2_offset() + self.output_dim() * self.hidden_dim
    }

    fn b2_offset(&self) -> usize {
        self.skip_offset() + self.output_dim() * self.input_dim
    }

    pub fn forward_cached(&self, x: &[f64]) -> Activations {
        let (h, i, o) = (self.hidden_dim, self.input_dim, self.output_dim());
        let p = &self.params;
        let b1 = self.b1_offset();
        let w2 = self.w2_offset();
        let skip = self.skip_offset();
        let b2 = self.b2_offset();

        let hidden: Vec<f64> = (0..h)
            .map(|j| {
                let z = p[b1 + j] + dot(&p[j * i..(j + 1) * i], x);
                z.max(0.0)
            })
            .collect();
        let raw: Vec<f64> = (0..o)
            .map(|k| {
                p[b2 + k]
                    + dot(&p[w2 + k * h..w2 + (k + 1) * h], &hidden)
                    + dot(&p[skip + k * i..skip + (k + 1) * i], x)
            })
            .collect();

        let hz = self.horizon;
        let mut output = raw.clone();
        for step in 0..hz {
            output[2 * hz + step] = raw[hz + step] + softplus(raw[2 * hz + step]);
        }
        Activations {
            hidden,
            raw,
            output,
        }
    }

    pub fn forward(&self, x: &[f64]) -> HeadOutput {
        let out = self.forward_cached(x).output;
        let hz = self.horizon;
        HeadOutput {
            point: out[..hz].to_vec(),
            low: out[hz..2 * hz].to_vec(),
            high: out[2 * hz..].to_vec(),
        }
    }

    /// Accumulate parameter gradients for one example into `grad`. `d_out`
    /// is the loss gradient with respect to the head values.
    pub fn backward(&self, x: &[f64], act: &Activations, d_out: &[f64], grad: &mut [f64]) {
        let (h, i, o) = (self.hidden_dim, self.input_dim, self.output_dim());
        let hz = self.horizon;
        let mut d_raw = d_out.to_vec();
        for step in 0..hz {
            let d_high = d_out[2 * hz + step];
            d_raw[hz + step] += d_high;
            d_raw[2 * hz + step] = d_high * sigmoid(act.raw[2 * hz + step]);
        }
        let p = &self.params;
        let b1 = self.b1_offset();
        let w2 = self.w2_offset();
        let skip = self.skip_offset();
        let b2 = self.b2_offset();

        let mut d_hidden = vec![0.0; h];
        for k in 0..o {
            let d = d_raw[k];
            if d == 0.0 {
                continue;
            }
            grad[b2 + k] += d;
            for j in 0..h {
                grad[w2 + k * h + j] += d * act.hidden[j];
                d_hidden[j] += d * p[w2 + k * h + j];
            }
            for m in 0..i {
                grad[skip + k * i + m] += d * x[m];
            }
        }
        for j in 0..h {
            if act.hidden[j] <= 0.0 {
                continue;
            }
            let d = d_hidden[j];
            grad[b1 + j] += d;
            for m in 0..i {
                grad[j * i + m] += d * x[m];
            }
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `ln(1 + e^x)` without overflow for large `x`.
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: i32,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl Adam {
    pub fn new(param_count: usize, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: vec![0.0; param_count],
            v: vec![0.0; param_count],
        }
    }

    pub fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        self.t = self.t.saturating_add(1);
        let b1t = 1.0 - self.beta1.powi(self.t);
        let b2t = 1.0 - self.beta2.powi(self.t);
        for (idx, g) in grad.iter().enumerate() {
            self.m[idx] = self.beta1 * self.m[idx] + (1.0 - self.beta1) * g;
            self.v[idx] = self.beta2 * self.v[idx] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[idx] / b1t;
            let v_hat = self.v[idx] / b2t;
            params[idx] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}
