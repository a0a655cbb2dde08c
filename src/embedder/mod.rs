//! Chunking, batching and rate-limited submission to an embedding service.

pub mod batch;
pub mod chunk;
pub mod cohere;
pub mod rate_limit;

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use thiserror::Error;

use crate::error::PipelineError;

pub use batch::{BatchEmbedder, EmbedSettings};
pub use chunk::{chunk_documents, chunk_text, Chunk, TextChunks};
pub use cohere::CohereEmbedder;
pub use rate_limit::{RateLimit, RateLimiter};

/// How the service shortens inputs longer than its context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Truncate {
    None,
    Start,
    #[default]
    End,
}

impl Truncate {
    /// Wire name, also used in cache fingerprints.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Start => "START",
            Self::End => "END",
        }
    }
}

/// One batch submitted to the service.
#[derive(Debug, Clone, Copy)]
pub struct EmbedRequest<'a> {
    pub texts: &'a [&'a str],
    pub model: &'a str,
    pub truncate: Truncate,
}

/// Failure reported by an embedding service.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ServiceError {
    /// Whether retrying later could succeed (throttling, outages).
    pub transient: bool,
    pub message: String,
}

impl ServiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for PipelineError {
    fn from(err: ServiceError) -> Self {
        PipelineError::ServiceCallFailure {
            transient: err.transient,
            message: err.message,
        }
    }
}

/// Remote (or in-process) text embedding capability.
pub trait EmbeddingService: Send + Sync {
    /// Returns one vector per input text, in input order.
    fn embed(&self, request: &EmbedRequest<'_>) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// Embedding counters shared with the runner.
#[derive(Debug, Default)]
pub struct EmbedProgress {
    total_chunks: AtomicUsize,
    embedded_chunks: AtomicUsize,
    service_calls: AtomicUsize,
}

impl EmbedProgress {
    pub(crate) fn record_planned(&self, chunks: usize) {
        self.total_chunks.fetch_add(chunks, Ordering::Relaxed);
    }

    pub(crate) fn record_call(&self, chunks: usize) {
        self.service_calls.fetch_add(1, Ordering::Relaxed);
        self.embedded_chunks.fetch_add(chunks, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            embedded_chunks: self.embedded_chunks.load(Ordering::Relaxed),
            service_calls: self.service_calls.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`EmbedProgress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Chunks scheduled so far (grows as datasets are chunked).
    pub total_chunks: usize,
    pub embedded_chunks: usize,
    pub service_calls: usize,
}
