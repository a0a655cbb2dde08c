//! Batched, rate-limited embedding of a document table.

use std::sync::Arc;

use tracing::{debug, info};

use super::chunk::{chunk_documents, Chunk, DEFAULT_CHUNK_SIZE};
use super::rate_limit::{RateLimit, RateLimiter};
use super::{EmbedProgress, EmbedRequest, EmbeddingService, Truncate};
use crate::cache::Fingerprint;
use crate::embeddings::{EmbeddingMatrix, EmbeddingRecord};
use crate::error::{PipelineError, Result};
use crate::extract::DocumentTable;
use crate::runner::CancellationToken;

/// Default number of chunks per service call.
pub const DEFAULT_BATCH_SIZE: usize = 96;

/// Knobs of the embedding stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedSettings {
    pub model: String,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub truncate: Truncate,
    pub rate_limit: RateLimit,
}

impl Default for EmbedSettings {
    fn default() -> Self {
        Self {
            model: "embed-english-v3.0".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            truncate: Truncate::End,
            rate_limit: RateLimit::default(),
        }
    }
}

impl EmbedSettings {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(PipelineError::invalid_parameter("model", "must not be empty"));
        }
        if self.chunk_size == 0 {
            return Err(PipelineError::invalid_parameter("chunk_size", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::invalid_parameter("batch_size", "must be at least 1"));
        }
        if self.rate_limit.calls > 0 && self.rate_limit.per.is_zero() {
            return Err(PipelineError::invalid_parameter(
                "rate_limit",
                "window must be longer than zero",
            ));
        }
        Ok(())
    }

    /// Mixes the settings that change vectors into a fingerprint. Batch size
    /// and rate limits only affect pacing.
    pub fn fingerprint(&self, fingerprint: Fingerprint) -> Fingerprint {
        fingerprint
            .str(&self.model)
            .u64(self.chunk_size as u64)
            .str(self.truncate.as_str())
    }
}

/// Turns document tables into embedding matrices through a service.
///
/// The limiter lives as long as the embedder, so the call budget spans every
/// dataset of a run.
pub struct BatchEmbedder {
    service: Arc<dyn EmbeddingService>,
    settings: EmbedSettings,
    limiter: RateLimiter,
    progress: Arc<EmbedProgress>,
}

impl BatchEmbedder {
    pub fn new(service: Arc<dyn EmbeddingService>, settings: EmbedSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            service,
            limiter: RateLimiter::new(settings.rate_limit),
            settings,
            progress: Arc::new(EmbedProgress::default()),
        })
    }

    pub fn settings(&self) -> &EmbedSettings {
        &self.settings
    }

    /// Shared progress counters.
    pub fn progress(&self) -> Arc<EmbedProgress> {
        Arc::clone(&self.progress)
    }

    /// Embeds every chunk of `table`.
    ///
    /// Cancellation is checked before each batch; a cancelled or failed run
    /// returns an error and produces no matrix.
    pub fn embed_table(
        &mut self,
        table: &DocumentTable,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingMatrix> {
        let chunks: Vec<Chunk> =
            chunk_documents(&table.documents, self.settings.chunk_size).collect();
        if chunks.is_empty() {
            return Err(PipelineError::invalid_parameter(
                "documents",
                format!("dataset '{}' has no text to embed", table.dataset),
            ));
        }
        self.progress.record_planned(chunks.len());
        info!(
            dataset = %table.dataset,
            chunks = chunks.len(),
            batch_size = self.settings.batch_size,
            "embedding dataset"
        );

        let mut records = Vec::with_capacity(chunks.len());
        for (batch_index, batch) in chunks.chunks(self.settings.batch_size).enumerate() {
            cancel.check()?;
            let texts: Vec<&str> = batch.iter().map(|chunk| chunk.text.as_str()).collect();
            let request = EmbedRequest {
                texts: &texts,
                model: &self.settings.model,
                truncate: self.settings.truncate,
            };
            let vectors = self.service.embed(&request)?;
            if vectors.len() != batch.len() {
                return Err(PipelineError::ServiceCallFailure {
                    transient: false,
                    message: format!(
                        "service returned {} embeddings for {} texts",
                        vectors.len(),
                        batch.len()
                    ),
                });
            }
            self.progress.record_call(batch.len());
            debug!(batch = batch_index, texts = batch.len(), "embedded batch");

            for (chunk, vector) in batch.iter().zip(vectors) {
                let document = &table.documents[chunk.document_id.0];
                records.push(EmbeddingRecord {
                    document_id: chunk.document_id,
                    chunk_index: chunk.sequence_index,
                    vector,
                    display_name: document.display_name.clone(),
                    columns: document.columns.clone(),
                });
            }
            self.limiter.record_call(cancel)?;
        }

        EmbeddingMatrix::from_records(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::ServiceError;
    use crate::extract::Document;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Records batch sizes and answers with `[text length, batch index]`.
    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<usize>>,
    }

    impl EmbeddingService for Recorder {
        fn embed(
            &self,
            request: &EmbedRequest<'_>,
        ) -> std::result::Result<Vec<Vec<f32>>, ServiceError> {
            let mut batches = self.batches.lock().unwrap();
            let index = batches.len() as f32;
            batches.push(request.texts.len());
            Ok(request
                .texts
                .iter()
                .map(|text| vec![text.chars().count() as f32, index])
                .collect())
        }
    }

    struct Failing(bool);

    impl EmbeddingService for Failing {
        fn embed(&self, _: &EmbedRequest<'_>) -> std::result::Result<Vec<Vec<f32>>, ServiceError> {
            if self.0 {
                Err(ServiceError::transient("429 too many requests"))
            } else {
                Ok(vec![vec![1.0]])
            }
        }
    }

    fn table(texts: &[&str]) -> DocumentTable {
        DocumentTable {
            dataset: "notes".into(),
            documents: texts
                .iter()
                .enumerate()
                .map(|(i, text)| Document {
                    source_path: PathBuf::from(format!("{i}.txt")),
                    display_name: format!("doc{i}"),
                    text: text.to_string(),
                    links: Vec::new(),
                    columns: BTreeMap::new(),
                })
                .collect(),
        }
    }

    fn settings(chunk_size: usize, batch_size: usize) -> EmbedSettings {
        EmbedSettings {
            chunk_size,
            batch_size,
            rate_limit: RateLimit {
                calls: 0,
                per: Duration::ZERO,
            },
            ..EmbedSettings::default()
        }
    }

    #[test]
    fn batches_chunks_across_documents() {
        let service = Arc::new(Recorder::default());
        let mut embedder = BatchEmbedder::new(service.clone(), settings(4, 2)).unwrap();
        let matrix = embedder
            .embed_table(&table(&["aa bb cc", "dd ee"]), &CancellationToken::new())
            .unwrap();

        assert_eq!(*service.batches.lock().unwrap(), vec![2, 1]);
        assert_eq!(matrix.names, vec!["doc0", "doc0", "doc1"]);
        assert_eq!(matrix.vectors.column(0).to_vec(), vec![5.0, 2.0, 5.0]);
        assert_eq!(matrix.vectors.column(1).to_vec(), vec![0.0, 0.0, 1.0]);
        assert_eq!(
            embedder.progress().snapshot(),
            crate::embedder::ProgressSnapshot {
                total_chunks: 3,
                embedded_chunks: 3,
                service_calls: 2,
            }
        );
    }

    #[test]
    fn two_calls_per_second_over_five_batches() {
        let service = Arc::new(Recorder::default());
        let mut settings = settings(512, 1);
        settings.rate_limit = RateLimit {
            calls: 2,
            per: Duration::from_secs(1),
        };
        let mut embedder = BatchEmbedder::new(service.clone(), settings).unwrap();
        let five = table(&["one", "two", "three", "four", "five"]);

        let started = Instant::now();
        embedder.embed_table(&five, &CancellationToken::new()).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(*service.batches.lock().unwrap(), vec![1; 5]);
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[test]
    fn service_errors_keep_their_classification() {
        let mut embedder = BatchEmbedder::new(Arc::new(Failing(true)), settings(10, 4)).unwrap();
        match embedder.embed_table(&table(&["hello"]), &CancellationToken::new()) {
            Err(PipelineError::ServiceCallFailure { transient, message }) => {
                assert!(transient);
                assert!(message.contains("429"));
            }
            other => panic!("expected service failure, got {other:?}"),
        }
    }

    #[test]
    fn short_responses_are_rejected() {
        let mut embedder = BatchEmbedder::new(Arc::new(Failing(false)), settings(2, 4)).unwrap();
        let err = embedder
            .embed_table(&table(&["aa bb"]), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ServiceCallFailure {
                transient: false,
                ..
            }
        ));
    }

    #[test]
    fn cancelled_token_stops_before_first_call() {
        let service = Arc::new(Recorder::default());
        let mut embedder = BatchEmbedder::new(service.clone(), settings(5, 2)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            embedder.embed_table(&table(&["aa"]), &cancel),
            Err(PipelineError::Cancelled)
        ));
        assert!(service.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_tables_and_bad_settings_are_rejected() {
        let service = Arc::new(Recorder::default());
        let mut embedder = BatchEmbedder::new(service.clone(), settings(5, 2)).unwrap();
        assert!(embedder
            .embed_table(&table(&["   "]), &CancellationToken::new())
            .is_err());
        assert!(BatchEmbedder::new(service.clone(), settings(0, 2)).is_err());
        assert!(BatchEmbedder::new(service, settings(5, 0)).is_err());
    }

    #[test]
    fn fingerprint_ignores_pacing_knobs() {
        let a = settings(5, 2).fingerprint(Fingerprint::new()).finish();
        let b = settings(5, 64).fingerprint(Fingerprint::new()).finish();
        let c = settings(6, 2).fingerprint(Fingerprint::new()).finish();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
