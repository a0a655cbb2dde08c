//! Principal component analysis by power iteration.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use super::Reducer;
use crate::error::{PipelineError, Result};

/// Projects rows onto the leading principal axes.
///
/// Eigenvectors come from power iteration with Gram-Schmidt deflation, run on
/// whichever of the covariance (`dims x dims`) or Gram (`rows x rows`) matrix
/// is smaller. Column signs are fixed so the largest-magnitude score is
/// positive.
///
/// Components beyond `min(rows, dims)` have no axis to project on and come
/// back as zero columns, which the degenerate-column policy then handles.
#[derive(Debug, Clone)]
pub struct Pca {
    seed: u64,
    max_iterations: usize,
    tolerance: f64,
}

impl Pca {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_iterations: 500,
            tolerance: 1e-10,
        }
    }
}

impl Reducer for Pca {
    fn fit_transform(&self, data: ArrayView2<'_, f32>, components: usize) -> Result<Array2<f32>> {
        let (rows, dims) = data.dim();
        if components == 0 {
            return Err(PipelineError::invalid_parameter(
                "components",
                "pca needs at least one component",
            ));
        }
        let solvable = components.min(rows).min(dims);
        if solvable < components {
            warn!(
                components,
                rows,
                dims,
                "fewer axes than pca components, padding with zero columns"
            );
        }
        let centered = center(data);
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut scores = Array2::<f64>::zeros((rows, components));
        if solvable == 0 {
            return Ok(scores.mapv(|v| v as f32));
        }
        if dims <= rows {
            let covariance = centered.t().dot(&centered);
            let axes = self.top_eigenvectors(&covariance, solvable, &mut rng);
            for (k, (axis, _)) in axes.iter().enumerate() {
                scores.column_mut(k).assign(&centered.dot(axis));
            }
        } else {
            let gram = centered.dot(&centered.t());
            let axes = self.top_eigenvectors(&gram, solvable, &mut rng);
            for (k, (axis, eigenvalue)) in axes.iter().enumerate() {
                scores
                    .column_mut(k)
                    .assign(&(axis * eigenvalue.max(0.0).sqrt()));
            }
        }

        for mut column in scores.axis_iter_mut(Axis(1)) {
            let pivot = column
                .iter()
                .copied()
                .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
            if pivot < 0.0 {
                column.mapv_inplace(|v| -v);
            }
        }
        Ok(scores.mapv(|v| v as f32))
    }
}

impl Pca {
    fn top_eigenvectors(
        &self,
        matrix: &Array2<f64>,
        count: usize,
        rng: &mut StdRng,
    ) -> Vec<(Array1<f64>, f64)> {
        let dim = matrix.nrows();
        let mut found: Vec<(Array1<f64>, f64)> = Vec::with_capacity(count);
        for _ in 0..count {
            let mut v = start_vector(dim, &found, rng);
            for _ in 0..self.max_iterations {
                let mut next = matrix.dot(&v);
                if !orthonormalize(&mut next, &found) {
                    // Remaining spectrum is zero; any orthogonal direction will do.
                    break;
                }
                let diff = (&next - &v).mapv(|x| x * x).sum().sqrt();
                v = next;
                if diff < self.tolerance {
                    break;
                }
            }
            let eigenvalue = v.dot(&matrix.dot(&v));
            found.push((v, eigenvalue));
        }
        found
    }
}

fn center(data: ArrayView2<'_, f32>) -> Array2<f64> {
    let data = data.mapv(f64::from);
    match data.mean_axis(Axis(0)) {
        Some(mean) => &data - &mean,
        None => data,
    }
}

fn start_vector(dim: usize, basis: &[(Array1<f64>, f64)], rng: &mut StdRng) -> Array1<f64> {
    let mut v = Array1::from_shape_fn(dim, |_| rng.gen_range(-1.0..1.0));
    if orthonormalize(&mut v, basis) {
        return v;
    }
    for axis in 0..dim {
        let mut unit = Array1::zeros(dim);
        unit[axis] = 1.0;
        if orthonormalize(&mut unit, basis) {
            return unit;
        }
    }
    v
}

/// Removes the projection onto `basis` and normalizes; false when nothing is left.
fn orthonormalize(v: &mut Array1<f64>, basis: &[(Array1<f64>, f64)]) -> bool {
    for (axis, _) in basis {
        let projection = v.dot(axis);
        v.scaled_add(-projection, axis);
    }
    let norm = v.dot(v).sqrt();
    if norm < 1e-12 {
        return false;
    }
    *v /= norm;
    true
}
