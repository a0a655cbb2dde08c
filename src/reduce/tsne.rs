//! Exact t-SNE (t-distributed stochastic neighbor embedding).

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::Reducer;
use crate::error::{PipelineError, Result};

const EXAGGERATION: f64 = 12.0;
const EXAGGERATION_ITERATIONS: usize = 100;
const MOMENTUM_SWITCH: usize = 250;
const MIN_GAIN: f64 = 0.01;

/// O(n^2) t-SNE with early exaggeration, momentum and adaptive gains.
#[derive(Debug, Clone)]
pub struct Tsne {
    seed: u64,
    perplexity: f64,
    iterations: usize,
}

impl Tsne {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            perplexity: 30.0,
            iterations: 500,
        }
    }

    pub fn with_perplexity(mut self, perplexity: f64) -> Self {
        self.perplexity = perplexity;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }
}

impl Reducer for Tsne {
    fn fit_transform(&self, data: ArrayView2<'_, f32>, components: usize) -> Result<Array2<f32>> {
        if components == 0 {
            return Err(PipelineError::invalid_parameter("components", "must be at least 1"));
        }
        let rows = data.nrows();
        if rows < 2 {
            return Ok(Array2::zeros((rows, components)));
        }

        let distances = squared_distances(&data.mapv(f64::from));
        // Perplexity must stay below the neighbor count for the search to converge.
        let perplexity = self.perplexity.min((rows - 1) as f64 / 3.0).max(1.0);
        let p = joint_probabilities(&distances, perplexity);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut y = Array2::from_shape_fn((rows, components), |_| rng.gen_range(-1e-4..1e-4));
        let mut update = Array2::<f64>::zeros((rows, components));
        let mut gains = Array2::<f64>::ones((rows, components));
        let learning_rate = (rows as f64 / EXAGGERATION / 4.0).max(50.0);

        for iteration in 0..self.iterations {
            let exaggeration = if iteration < EXAGGERATION_ITERATIONS {
                EXAGGERATION
            } else {
                1.0
            };
            let momentum = if iteration < MOMENTUM_SWITCH { 0.5 } else { 0.8 };
            let gradient = gradient(&p, &y, exaggeration);

            for ((g, u), gain) in gradient.iter().zip(update.iter_mut()).zip(gains.iter_mut()) {
                *gain = if (*g > 0.0) != (*u > 0.0) {
                    *gain + 0.2
                } else {
                    (*gain * 0.8).max(MIN_GAIN)
                };
                *u = momentum * *u - learning_rate * *gain * g;
            }
            y += &update;
            if let Some(mean) = y.mean_axis(Axis(0)) {
                y -= &mean;
            }
        }

        if y.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::invalid_parameter(
                "tsne",
                "optimization diverged to non-finite coordinates",
            ));
        }
        Ok(y.mapv(|v| v as f32))
    }
}

pub(crate) fn squared_distances(data: &Array2<f64>) -> Array2<f64> {
    let rows = data.nrows();
    let mut out = Array2::zeros((rows, rows));
    for i in 0..rows {
        for j in (i + 1)..rows {
            let d: f64 = data
                .row(i)
                .iter()
                .zip(data.row(j).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            out[[i, j]] = d;
            out[[j, i]] = d;
        }
    }
    out
}

/// Symmetrized input affinities with per-row bandwidths matched to `perplexity`.
fn joint_probabilities(distances: &Array2<f64>, perplexity: f64) -> Array2<f64> {
    let rows = distances.nrows();
    let target_entropy = perplexity.ln();
    let mut conditional = Array2::zeros((rows, rows));
    for i in 0..rows {
        let row = row_affinities(distances.row(i), i, target_entropy);
        conditional.row_mut(i).assign(&row);
    }
    let mut joint = &conditional + &conditional.t();
    joint /= 2.0 * rows as f64;
    joint.mapv_inplace(|v| v.max(1e-12));
    joint
}

fn row_affinities(distances: ArrayView1<'_, f64>, own: usize, target_entropy: f64) -> Array1<f64> {
    let nearest = distances
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != own)
        .map(|(_, d)| *d)
        .fold(f64::INFINITY, f64::min);
    let mut beta = 1.0;
    let (mut beta_min, mut beta_max) = (0.0_f64, f64::INFINITY);
    let mut row = Array1::zeros(distances.len());

    for _ in 0..64 {
        let mut sum = 0.0;
        let mut weighted = 0.0;
        for (j, d) in distances.iter().enumerate() {
            if j == own {
                row[j] = 0.0;
                continue;
            }
            let shifted = d - nearest;
            let p = (-shifted * beta).exp();
            row[j] = p;
            sum += p;
            weighted += shifted * p;
        }
        row /= sum;
        let entropy = sum.ln() + beta * weighted / sum;
        let gap = entropy - target_entropy;
        if gap.abs() < 1e-5 {
            break;
        }
        if gap > 0.0 {
            beta_min = beta;
            beta = if beta_max.is_infinite() {
                beta * 2.0
            } else {
                (beta + beta_max) / 2.0
            };
        } else {
            beta_max = beta;
            beta = (beta + beta_min) / 2.0;
        }
    }
    row
}

fn gradient(p: &Array2<f64>, y: &Array2<f64>, exaggeration: f64) -> Array2<f64> {
    let rows = y.nrows();
    let mut kernel = Array2::<f64>::zeros((rows, rows));
    let mut total = 0.0;
    for i in 0..rows {
        for j in (i + 1)..rows {
            let d: f64 = y
                .row(i)
                .iter()
                .zip(y.row(j).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            let k = 1.0 / (1.0 + d);
            kernel[[i, j]] = k;
            kernel[[j, i]] = k;
            total += 2.0 * k;
        }
    }

    let mut grad = Array2::zeros(y.dim());
    for i in 0..rows {
        for j in 0..rows {
            if i == j {
                continue;
            }
            let q = (kernel[[i, j]] / total).max(1e-12);
            let factor = 4.0 * (exaggeration * p[[i, j]] - q) * kernel[[i, j]];
            for c in 0..y.ncols() {
                grad[[i, c]] += factor * (y[[i, c]] - y[[j, c]]);
            }
        }
    }
    grad
}
