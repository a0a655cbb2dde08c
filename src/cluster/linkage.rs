//! Agglomerative merge history stored as an arena.
//!
//! Leaves are ids `0..leaf_count`; the cluster created by edge `i` has id
//! `leaf_count + i`, so a synthetic id resolves to its edge at
//! `id - leaf_count`.

use kodama::{linkage as kodama_linkage, Method as KodamaMethod};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};

/// One merge of two clusters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkageEdge {
    pub cluster1: usize,
    pub cluster2: usize,
    pub distance: f64,
    /// Leaves under the merged cluster.
    pub merged_size: usize,
}

/// Merge criterion used when building a linkage from vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkageMethod {
    Single,
    Complete,
    Average,
    #[default]
    Ward,
}

impl From<LinkageMethod> for KodamaMethod {
    fn from(method: LinkageMethod) -> Self {
        match method {
            LinkageMethod::Single => KodamaMethod::Single,
            LinkageMethod::Complete => KodamaMethod::Complete,
            LinkageMethod::Average => KodamaMethod::Average,
            LinkageMethod::Ward => KodamaMethod::Ward,
        }
    }
}

/// Validated merge arena.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Linkage {
    leaf_count: usize,
    edges: Vec<LinkageEdge>,
}

impl Linkage {
    /// Checks that every edge references only leaves or earlier merges, that
    /// no cluster is merged twice and that sizes add up.
    pub fn new(leaf_count: usize, edges: Vec<LinkageEdge>) -> Result<Self> {
        if leaf_count == 0 && !edges.is_empty() {
            return Err(PipelineError::invalid_linkage(0, "edges without leaves"));
        }
        let mut merged = vec![false; leaf_count + edges.len()];
        let mut sizes: Vec<usize> = vec![1; leaf_count];
        for (index, edge) in edges.iter().enumerate() {
            let available = leaf_count + index;
            if edge.cluster1 == edge.cluster2 {
                return Err(PipelineError::invalid_linkage(
                    index,
                    format!("cluster {} merged with itself", edge.cluster1),
                ));
            }
            for id in [edge.cluster1, edge.cluster2] {
                if id >= available {
                    return Err(PipelineError::invalid_linkage(
                        index,
                        format!("cluster {id} is not defined before this merge"),
                    ));
                }
                if merged[id] {
                    return Err(PipelineError::invalid_linkage(
                        index,
                        format!("cluster {id} was already merged"),
                    ));
                }
                merged[id] = true;
            }
            let expected = sizes[edge.cluster1] + sizes[edge.cluster2];
            if edge.merged_size != expected {
                return Err(PipelineError::invalid_linkage(
                    index,
                    format!("merged size {} but children hold {expected}", edge.merged_size),
                ));
            }
            sizes.push(expected);
        }
        Ok(Self { leaf_count, edges })
    }

    /// Clusters `vectors` row-wise by Euclidean distance.
    pub fn from_vectors(vectors: ArrayView2<'_, f32>, method: LinkageMethod) -> Result<Self> {
        let n = vectors.nrows();
        if n < 2 {
            return Self::new(n, Vec::new());
        }
        let mut condensed = Vec::with_capacity(n * (n - 1) / 2);
        for i in 0..n - 1 {
            for j in i + 1..n {
                let d: f64 = vectors
                    .row(i)
                    .iter()
                    .zip(vectors.row(j).iter())
                    .map(|(a, b)| {
                        let dx = f64::from(*a) - f64::from(*b);
                        dx * dx
                    })
                    .sum::<f64>()
                    .sqrt();
                condensed.push(d);
            }
        }
        info!(leaves = n, method = ?method, "building linkage");
        let dendrogram = kodama_linkage(&mut condensed, n, method.into());
        let edges = dendrogram
            .steps()
            .iter()
            .map(|step| LinkageEdge {
                cluster1: step.cluster1,
                cluster2: step.cluster2,
                distance: step.dissimilarity,
                merged_size: step.size,
            })
            .collect();
        Self::new(n, edges)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn edges(&self) -> &[LinkageEdge] {
        &self.edges
    }

    /// Total ids: leaves plus merges.
    pub fn node_count(&self) -> usize {
        self.leaf_count + self.edges.len()
    }

    /// Edge that created synthetic cluster `id`; `None` for leaves.
    pub fn edge_for(&self, id: usize) -> Option<&LinkageEdge> {
        id.checked_sub(self.leaf_count)
            .and_then(|index| self.edges.get(index))
    }

    /// Leaves under cluster `id`.
    pub fn size_of(&self, id: usize) -> Option<usize> {
        if id < self.leaf_count {
            Some(1)
        } else {
            self.edge_for(id).map(|edge| edge.merged_size)
        }
    }
}
