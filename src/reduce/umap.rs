//! Compact UMAP: fuzzy k-nearest-neighbor graph plus stochastic layout.

use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::pca::Pca;
use super::tsne::squared_distances;
use super::Reducer;
use crate::error::{PipelineError, Result};

// Curve parameters fitted for min_dist = 0.1, spread = 1.0.
const CURVE_A: f64 = 1.577;
const CURVE_B: f64 = 0.8951;
const NEGATIVE_SAMPLES: usize = 5;
const GRADIENT_CLIP: f64 = 4.0;
const INIT_SCALE: f64 = 10.0;

/// Uniform manifold approximation and projection with brute-force neighbors.
#[derive(Debug, Clone)]
pub struct Umap {
    seed: u64,
    neighbors: usize,
    epochs: usize,
}

struct Edge {
    head: usize,
    tail: usize,
    weight: f64,
}

impl Umap {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            neighbors: 15,
            epochs: 200,
        }
    }

    pub fn with_neighbors(mut self, neighbors: usize) -> Self {
        self.neighbors = neighbors;
        self
    }

    fn fuzzy_graph(&self, data: &Array2<f64>) -> Vec<Edge> {
        let rows = data.nrows();
        let k = self.neighbors.min(rows - 1).max(1);
        let distances = squared_distances(data).mapv(f64::sqrt);
        let target = (k as f64).log2();

        let mut weights = Array2::<f64>::zeros((rows, rows));
        for i in 0..rows {
            let mut order: Vec<usize> = (0..rows).filter(|&j| j != i).collect();
            order.sort_by(|&a, &b| distances[[i, a]].total_cmp(&distances[[i, b]]).then(a.cmp(&b)));
            order.truncate(k);
            let rho = distances[[i, order[0]]];
            let sigma = smooth_bandwidth(order.iter().map(|&j| distances[[i, j]] - rho), target);
            for &j in &order {
                weights[[i, j]] = (-(distances[[i, j]] - rho).max(0.0) / sigma).exp();
            }
        }

        let mut edges = Vec::new();
        for i in 0..rows {
            for j in (i + 1)..rows {
                let (a, b) = (weights[[i, j]], weights[[j, i]]);
                let weight = a + b - a * b;
                if weight > 0.0 {
                    edges.push(Edge {
                        head: i,
                        tail: j,
                        weight,
                    });
                }
            }
        }
        edges
    }

    fn initial_layout(
        &self,
        data: ArrayView2<'_, f32>,
        components: usize,
        rng: &mut StdRng,
    ) -> Array2<f64> {
        let rows = data.nrows();
        let seeded = Pca::new(self.seed)
            .fit_transform(data, components)
            .ok()
            .map(|layout| layout.mapv(f64::from));
        let mut layout = seeded.unwrap_or_else(|| {
            Array2::from_shape_fn((rows, components), |_| rng.gen_range(-1.0..1.0))
        });
        for mut column in layout.axis_iter_mut(Axis(1)) {
            let extent = column.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            if extent > 0.0 {
                column.mapv_inplace(|v| v / extent * INIT_SCALE);
            }
        }
        // Small jitter breaks ties between identical rows.
        layout.mapv_inplace(|v| v + rng.gen_range(-1e-3..1e-3));
        layout
    }
}

impl Reducer for Umap {
    fn fit_transform(&self, data: ArrayView2<'_, f32>, components: usize) -> Result<Array2<f32>> {
        if components == 0 {
            return Err(PipelineError::invalid_parameter("components", "must be at least 1"));
        }
        let rows = data.nrows();
        if rows < 2 {
            return Ok(Array2::zeros((rows, components)));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let edges = self.fuzzy_graph(&data.mapv(f64::from));
        let mut layout = self.initial_layout(data, components, &mut rng);
        let max_weight = edges.iter().fold(0.0_f64, |m, e| m.max(e.weight));

        for epoch in 0..self.epochs {
            let alpha = 1.0 - epoch as f64 / self.epochs as f64;
            for edge in &edges {
                if rng.gen::<f64>() * max_weight > edge.weight {
                    continue;
                }
                let (i, j) = (edge.head, edge.tail);
                let d2 = row_distance2(&layout, i, j);
                if d2 > 0.0 {
                    let coeff = -2.0 * CURVE_A * CURVE_B * d2.powf(CURVE_B - 1.0)
                        / (1.0 + CURVE_A * d2.powf(CURVE_B));
                    for c in 0..components {
                        let step = clip(coeff * (layout[[i, c]] - layout[[j, c]])) * alpha;
                        layout[[i, c]] += step;
                        layout[[j, c]] -= step;
                    }
                }
                for _ in 0..NEGATIVE_SAMPLES {
                    let other = rng.gen_range(0..rows);
                    if other == i {
                        continue;
                    }
                    let d2 = row_distance2(&layout, i, other);
                    let coeff = 2.0 * CURVE_B / ((0.001 + d2) * (1.0 + CURVE_A * d2.powf(CURVE_B)));
                    for c in 0..components {
                        let step = if d2 > 0.0 {
                            clip(coeff * (layout[[i, c]] - layout[[other, c]]))
                        } else {
                            GRADIENT_CLIP
                        };
                        layout[[i, c]] += step * alpha;
                    }
                }
            }
        }

        if layout.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::invalid_parameter(
                "umap",
                "layout diverged to non-finite coordinates",
            ));
        }
        Ok(layout.mapv(|v| v as f32))
    }
}

/// Binary search for the bandwidth whose membership mass equals `target`.
fn smooth_bandwidth(offsets: impl Iterator<Item = f64> + Clone, target: f64) -> f64 {
    let (mut lo, mut hi) = (0.0_f64, f64::INFINITY);
    let mut sigma = 1.0;
    for _ in 0..64 {
        let mass: f64 = offsets.clone().map(|d| (-d.max(0.0) / sigma).exp()).sum();
        if (mass - target).abs() < 1e-5 {
            break;
        }
        if mass > target {
            hi = sigma;
            sigma = (lo + hi) / 2.0;
        } else {
            lo = sigma;
            sigma = if hi.is_infinite() { sigma * 2.0 } else { (lo + hi) / 2.0 };
        }
    }
    sigma.max(1e-6)
}

fn row_distance2(layout: &Array2<f64>, a: usize, b: usize) -> f64 {
    layout
        .row(a)
        .iter()
        .zip(layout.row(b).iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

fn clip(value: f64) -> f64 {
    value.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn keeps_clusters_apart() {
        let mut rows = Vec::new();
        for i in 0..8 {
            let t = i as f32 * 0.05;
            rows.extend_from_slice(&[t, 0.0, 0.0, t]);
        }
        for i in 0..8 {
            let t = i as f32 * 0.05;
            rows.extend_from_slice(&[20.0 + t, 20.0, 20.0, t]);
        }
        let data = Array2::from_shape_vec((16, 4), rows).unwrap();
        let y = Umap::new(3).with_neighbors(5).fit_transform(data.view(), 2).unwrap();

        let centroid = |range: std::ops::Range<usize>| {
            y.slice(ndarray::s![range, ..]).mean_axis(Axis(0)).unwrap()
        };
        let (a, b) = (centroid(0..8), centroid(8..16));
        let gap = (&a - &b).mapv(|v| v * v).sum().sqrt();
        let spread = (0..8)
            .map(|r| (&y.row(r) - &a).mapv(|v| v * v).sum().sqrt())
            .fold(0.0_f32, f32::max);
        assert!(gap > spread, "gap {gap} spread {spread}");
    }

    #[test]
    fn bandwidth_matches_target_mass() {
        let offsets = [0.0, 0.5, 1.0, 2.0];
        let target = (offsets.len() as f64).log2();
        let sigma = smooth_bandwidth(offsets.iter().copied(), target);
        let mass: f64 = offsets.iter().map(|d| (-d / sigma).exp()).sum();
        assert!((mass - target).abs() < 1e-3);
    }

    #[test]
    fn handles_more_components_than_dimensions() {
        let data = array![[0.0_f32], [1.0], [2.0], [5.0]];
        let y = Umap::new(1).fit_transform(data.view(), 2).unwrap();
        assert_eq!(y.dim(), (4, 2));
        assert!(y.iter().all(|v| v.is_finite()));
    }
}
