//! Dimensionality reduction and per-column normalization.
//!
//! A reduction name such as `pca5` or `umap2` names an algorithm and a
//! component count. The reducer output is min-max normalized column by
//! column so every coordinate lies in `[0, 1]`.

pub mod pca;
pub mod tsne;
pub mod umap;

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{decode_matrix, encode_matrix, Artifact, ArtifactFormat};
use crate::embeddings::EmbeddingMatrix;
use crate::error::{CacheError, PipelineError, Result};

pub use pca::Pca;
pub use tsne::Tsne;
pub use umap::Umap;

/// Seed shared by every reducer so repeated runs agree.
pub const DEFAULT_SEED: u64 = 42;

/// Black-box dimensionality reduction.
pub trait Reducer {
    /// Maps `data` (`rows x dims`) to `rows x components`.
    fn fit_transform(&self, data: ArrayView2<'_, f32>, components: usize) -> Result<Array2<f32>>;
}

/// Supported algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionAlgorithm {
    Pca,
    Tsne,
    Umap,
}

impl ReductionAlgorithm {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Pca => "pca",
            Self::Tsne => "tsne",
            Self::Umap => "umap",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "pca" => Some(Self::Pca),
            "tsne" => Some(Self::Tsne),
            "umap" => Some(Self::Umap),
            _ => None,
        }
    }

    /// Seeded reducer for this algorithm.
    pub fn reducer(self, seed: u64) -> Box<dyn Reducer> {
        match self {
            Self::Pca => Box::new(Pca::new(seed)),
            Self::Tsne => Box::new(Tsne::new(seed)),
            Self::Umap => Box::new(Umap::new(seed)),
        }
    }
}

/// Parsed reduction name, e.g. `pca5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReductionMethod {
    pub algorithm: ReductionAlgorithm,
    pub components: usize,
}

impl ReductionMethod {
    pub fn new(algorithm: ReductionAlgorithm, components: usize) -> Self {
        Self {
            algorithm,
            components,
        }
    }

    /// Parses `<algorithm><components>`; the algorithm is case-insensitive.
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        let unknown = || PipelineError::UnknownReductionMethod(name.to_string());
        let prefix = trimmed.trim_end_matches(|c: char| c.is_ascii_digit());
        let digits = &trimmed[prefix.len()..];
        let algorithm = ReductionAlgorithm::from_prefix(prefix).ok_or_else(unknown)?;
        let components: usize = digits.parse().map_err(|_| unknown())?;
        if components == 0 {
            return Err(unknown());
        }
        Ok(Self::new(algorithm, components))
    }
}

impl FromStr for ReductionMethod {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl fmt::Display for ReductionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.algorithm.prefix(), self.components)
    }
}

/// What to do with a reduced column whose values are all equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DegeneratePolicy {
    /// Fill the column with 0.5 and warn.
    #[default]
    Midpoint,
    /// Fail with [`PipelineError::DegenerateColumn`].
    Fail,
}

impl DegeneratePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Midpoint => "midpoint",
            Self::Fail => "fail",
        }
    }
}

/// Normalized coordinates plus the labels of the source rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedMatrix {
    pub method: ReductionMethod,
    /// `rows x components`, each value in `[0, 1]`.
    pub coordinates: Array2<f32>,
    pub names: Vec<String>,
}

impl Artifact for ReducedMatrix {
    const FORMAT: ArtifactFormat = ArtifactFormat::Matrix;

    fn encode(&self, writer: &mut dyn Write) -> std::result::Result<(), CacheError> {
        encode_matrix(self, writer)
    }

    fn decode(reader: &mut dyn Read) -> std::result::Result<Self, CacheError> {
        decode_matrix(reader)
    }
}

/// Reduces `matrix` with `method` and normalizes the result.
pub fn reduce(
    matrix: &EmbeddingMatrix,
    method: ReductionMethod,
    policy: DegeneratePolicy,
    seed: u64,
) -> Result<ReducedMatrix> {
    info!(method = %method, rows = matrix.rows(), "reducing embeddings");
    let reducer = method.algorithm.reducer(seed);
    let raw = reducer.fit_transform(matrix.vectors.view(), method.components)?;
    if raw.dim() != (matrix.rows(), method.components) {
        return Err(PipelineError::invalid_parameter(
            "reducer",
            format!(
                "{method} returned shape {:?}, expected {:?}",
                raw.dim(),
                (matrix.rows(), method.components)
            ),
        ));
    }
    let coordinates = normalize_columns(raw, method, policy)?;
    Ok(ReducedMatrix {
        method,
        coordinates,
        names: matrix.names.clone(),
    })
}

/// Min-max normalizes every column independently into `[0, 1]`.
pub fn normalize_columns(
    mut values: Array2<f32>,
    method: ReductionMethod,
    policy: DegeneratePolicy,
) -> Result<Array2<f32>> {
    for (index, mut column) in values.axis_iter_mut(Axis(1)).enumerate() {
        let (min, max) = column
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = max - min;
        if !range.is_finite() || range < f32::EPSILON {
            match policy {
                DegeneratePolicy::Midpoint => {
                    warn!(method = %method, column = index, "constant reduced column, using 0.5");
                    column.fill(0.5);
                    continue;
                }
                DegeneratePolicy::Fail => {
                    return Err(PipelineError::DegenerateColumn {
                        method: method.to_string(),
                        column: index,
                    });
                }
            }
        }
        column.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
    }
    Ok(values)
}
