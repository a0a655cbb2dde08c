//! Error taxonomy shared by every pipeline stage.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by extraction, caching, embedding, reduction and coloring.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No extractor is registered for the extension.
    #[error("no extractor registered for extension '{0}'")]
    UnsupportedFormat(String),

    /// An input folder is missing or is not a directory.
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// A single file could not be extracted.
    #[error("extraction failed: {0}")]
    ExtractionFailure(#[from] doc_extract::ExtractError),

    /// An input folder produced no documents at all.
    #[error("no documents extracted from {} ({files_failed} of {files_seen} files failed)", folder.display())]
    NoDocuments {
        /// The input folder.
        folder: PathBuf,
        /// Files matching the accepted extensions.
        files_seen: usize,
        /// Files that failed to extract.
        files_failed: usize,
    },

    /// The embedding service rejected or failed a call.
    #[error("embedding service call failed (transient: {transient}): {message}")]
    ServiceCallFailure {
        /// Whether the service classified the failure as retryable.
        transient: bool,
        /// Service-provided detail.
        message: String,
    },

    /// A reduction name did not spell out a known algorithm and component count.
    #[error("unknown reduction method '{0}'")]
    UnknownReductionMethod(String),

    /// A reduced column has zero range and the policy forbids filling it.
    #[error("reduction {method} produced a constant column {column}")]
    DegenerateColumn {
        /// Reduction name, e.g. `pca5`.
        method: String,
        /// Zero-based column index.
        column: usize,
    },

    /// The linkage references clusters out of order or with wrong sizes.
    #[error("invalid linkage at edge {edge}: {message}")]
    InvalidLinkage {
        /// Zero-based edge index.
        edge: usize,
        /// What was wrong.
        message: String,
    },

    /// A parameter is outside the range the operation accepts.
    #[error("invalid parameter '{name}': {message}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// The run was stopped through its cancellation token.
    #[error("run cancelled")]
    Cancelled,

    /// The background worker thread panicked before reporting a result.
    #[error("pipeline worker panicked")]
    WorkerPanicked,

    /// A cache artifact could not be read or written.
    #[error("cache artifact {}: {source}", path.display())]
    Cache {
        /// Artifact file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: CacheError,
    },
}

impl PipelineError {
    /// Builds an [`PipelineError::InvalidParameter`].
    pub fn invalid_parameter(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_linkage(edge: usize, message: impl Into<String>) -> Self {
        Self::InvalidLinkage {
            edge,
            message: message.into(),
        }
    }

    pub(crate) fn cache(path: impl Into<PathBuf>, source: impl Into<CacheError>) -> Self {
        Self::Cache {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Low-level causes of cache failures.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Structured artifact could not be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Matrix artifact could not be (de)serialized.
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// Matrix artifact header did not match.
    #[error("not a matrix artifact (bad magic or version)")]
    BadHeader,
}
