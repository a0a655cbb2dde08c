//! Shared embedding data structures used across pipeline stages.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::cache::{decode_matrix, encode_matrix, Artifact, ArtifactFormat};
use crate::error::{CacheError, PipelineError, Result};

/// Position of a document inside its dataset's extracted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub usize);

/// One embedded chunk joined back with its document's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Owning document.
    pub document_id: DocumentId,
    /// Chunk position inside the document.
    pub chunk_index: usize,
    /// Model embedding vector.
    pub vector: Vec<f32>,
    /// Document label.
    pub display_name: String,
    /// Extractor-provided document columns.
    pub columns: BTreeMap<String, String>,
}

/// Row-per-record embedding vectors plus their parallel labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMatrix {
    /// `rows x dimensions` vectors.
    pub vectors: Array2<f32>,
    /// One label per row.
    pub names: Vec<String>,
}

impl EmbeddingMatrix {
    /// Assembles records into a matrix, checking that every vector has the
    /// same dimensionality.
    pub fn from_records(records: &[EmbeddingRecord]) -> Result<Self> {
        let dimensions = records.first().map(|r| r.vector.len()).unwrap_or(0);
        let mut flat = Vec::with_capacity(records.len() * dimensions);
        for (row, record) in records.iter().enumerate() {
            if record.vector.len() != dimensions {
                return Err(PipelineError::invalid_parameter(
                    "vector",
                    format!(
                        "row {row} has {} dimensions, expected {dimensions}",
                        record.vector.len()
                    ),
                ));
            }
            flat.extend_from_slice(&record.vector);
        }
        let vectors = Array2::from_shape_vec((records.len(), dimensions), flat)
            .map_err(|err| PipelineError::invalid_parameter("vector", err.to_string()))?;
        let names = records.iter().map(|r| r.display_name.clone()).collect();
        Ok(Self { vectors, names })
    }

    /// Stacks matrices row-wise in the given order.
    pub fn concat(parts: &[EmbeddingMatrix]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(PipelineError::invalid_parameter(
                "datasets",
                "nothing to combine",
            ));
        };
        let dimensions = first.dimensions();
        if let Some(other) = parts.iter().find(|part| part.dimensions() != dimensions) {
            return Err(PipelineError::invalid_parameter(
                "vector",
                format!(
                    "cannot combine {dimensions}-dimensional and {}-dimensional embeddings",
                    other.dimensions()
                ),
            ));
        }
        let views: Vec<ArrayView2<'_, f32>> =
            parts.iter().map(|part| part.vectors.view()).collect();
        let vectors = concatenate(Axis(0), &views)
            .map_err(|err| PipelineError::invalid_parameter("vector", err.to_string()))?;
        let names = parts
            .iter()
            .flat_map(|part| part.names.iter().cloned())
            .collect();
        Ok(Self { vectors, names })
    }

    /// Number of embedded chunks.
    pub fn rows(&self) -> usize {
        self.vectors.nrows()
    }

    /// Vector dimensionality.
    pub fn dimensions(&self) -> usize {
        self.vectors.ncols()
    }
}

impl Artifact for EmbeddingMatrix {
    const FORMAT: ArtifactFormat = ArtifactFormat::Matrix;

    fn encode(&self, writer: &mut dyn Write) -> std::result::Result<(), CacheError> {
        encode_matrix(self, writer)
    }

    fn decode(reader: &mut dyn Read) -> std::result::Result<Self, CacheError> {
        decode_matrix(reader)
    }
}
