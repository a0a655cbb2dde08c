//! Core library entry points for the fractal-embeddings pipeline.
//!
//! Document folders are extracted, chunked and embedded through an
//! [`EmbeddingService`], reduced to low-dimensional coordinates and clustered
//! into a dendrogram whose nodes are colored by blending their children.

pub mod cache;
pub mod cluster;
pub mod controls;
pub mod embedder;
pub mod embeddings;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod reduce;
pub mod runner;

pub use cache::{CacheKey, CacheStore, KeyPolicy};
pub use cluster::{ColorAssignment, DendrogramExport, Linkage, LinkageEdge, Rgb};
pub use controls::{Cli, ColorSource, PipelineConfig};
pub use embedder::{CohereEmbedder, EmbedRequest, EmbedSettings, EmbeddingService, ServiceError};
pub use embeddings::{DocumentId, EmbeddingMatrix, EmbeddingRecord};
pub use error::{PipelineError, Result};
pub use extract::{Document, DocumentTable, ExtractorKind, ExtractorRegistry, InputFolder};
pub use pipeline::{Pipeline, PipelineOutput, RunReport};
pub use reduce::{DegeneratePolicy, ReducedMatrix, ReductionMethod};
pub use runner::{CancellationToken, PipelineRunner, RunStatus};
