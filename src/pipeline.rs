//! Staged pipeline: extract, embed, combine, reduce, then cluster and color.
//!
//! Every stage except the final clustering is gated by the [`CacheStore`]: a
//! stage whose artifact exists is loaded instead of recomputed, so a rerun
//! resumes after the last completed stage.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use tracing::{info, warn};

use crate::cache::{CacheKey, CacheStore, Fingerprint};
use crate::cluster::{leaf_colors, propagate_colors, ColorAssignment, Linkage};
use crate::controls::PipelineConfig;
use crate::embedder::{BatchEmbedder, EmbedProgress, EmbeddingService, ProgressSnapshot};
use crate::embeddings::EmbeddingMatrix;
use crate::error::{PipelineError, Result};
use crate::extract::{
    discover, extract_folder, DocumentTable, ExtractionSummary, ExtractorRegistry, InputFolder,
};
use crate::reduce::{reduce, ReducedMatrix};
use crate::runner::CancellationToken;

/// Counters describing one run, complete or aborted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub datasets: usize,
    /// Files seen, extracted and failed; zero for datasets served from cache.
    pub extraction: ExtractionSummary,
    /// Documents across all datasets, cached or not.
    pub documents: usize,
    pub rows: usize,
    pub chunks_embedded: usize,
    pub service_calls: usize,
    /// Artifacts loaded instead of computed.
    pub cached: Vec<String>,
    /// Artifacts computed and written.
    pub computed: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    fn record_extraction(&mut self, summary: ExtractionSummary) {
        self.extraction.files_seen += summary.files_seen;
        self.extraction.files_extracted += summary.files_extracted;
        self.extraction.files_failed += summary.files_failed;
        self.extraction.documents += summary.documents;
    }

    fn record_stage(&mut self, key: &CacheKey, cached: bool) {
        let name = key.name().to_string();
        if cached {
            self.cached.push(name);
        } else {
            self.computed.push(name);
        }
    }

    fn record_progress(&mut self, before: ProgressSnapshot, after: ProgressSnapshot) {
        self.chunks_embedded = after.embedded_chunks - before.embedded_chunks;
        self.service_calls = after.service_calls - before.service_calls;
    }
}

/// Results of a completed run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub combined: EmbeddingMatrix,
    /// One entry per planned reduction, in plan order.
    pub reductions: Vec<ReducedMatrix>,
    pub linkage: Linkage,
    pub colors: ColorAssignment,
    pub report: RunReport,
}

/// Sequential stage orchestrator.
pub struct Pipeline {
    config: PipelineConfig,
    registry: ExtractorRegistry,
    cache: CacheStore,
    embedder: BatchEmbedder,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, service: Arc<dyn EmbeddingService>) -> Result<Self> {
        config.validate()?;
        let cache = CacheStore::new(&config.output_dir, config.key_policy).with_force(config.force);
        let embedder = BatchEmbedder::new(service, config.embed.clone())?;
        Ok(Self {
            config,
            registry: ExtractorRegistry::default(),
            cache,
            embedder,
        })
    }

    /// Replaces the default extractor registry.
    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Embedding counters, shared with any runner polling this pipeline.
    pub fn progress(&self) -> Arc<EmbedProgress> {
        self.embedder.progress()
    }

    /// Runs every stage, stopping at the first stage error or cancellation.
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<PipelineOutput> {
        let started = Instant::now();
        let before = self.embedder.progress().snapshot();
        let mut report = RunReport::default();
        let result = self.run_stages(cancel, &mut report);
        report.record_progress(before, self.embedder.progress().snapshot());
        report.elapsed = started.elapsed();

        match result {
            Ok(mut output) => {
                info!(
                    datasets = report.datasets,
                    documents = report.documents,
                    rows = report.rows,
                    chunks = report.chunks_embedded,
                    calls = report.service_calls,
                    cached = report.cached.len(),
                    computed = report.computed.len(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "run complete"
                );
                output.report = report;
                Ok(output)
            }
            Err(err) => {
                warn!(error = %err, report = ?report, "run stopped");
                Err(err)
            }
        }
    }

    fn run_stages(
        &mut self,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<PipelineOutput> {
        let tables = self.extract_stage(cancel, report)?;
        let (combined, combined_fingerprint) = self.embed_stage(&tables, cancel, report)?;
        report.rows = combined.rows();
        let reductions = self.reduce_stage(&combined, combined_fingerprint, cancel, report)?;

        cancel.check()?;
        let linkage = Linkage::from_vectors(combined.vectors.view(), self.config.linkage)?;
        let source = self.config.color_source;
        let reduced = reductions
            .iter()
            .find(|reduced| reduced.method == source.method)
            .ok_or_else(|| {
                PipelineError::invalid_parameter(
                    "color_source",
                    format!("{} was not computed", source.method),
                )
            })?;
        let colors = propagate_colors(&linkage, &leaf_colors(reduced, source.first_column)?)?;
        info!(leaves = linkage.leaf_count(), nodes = colors.len(), "dendrogram colored");

        Ok(PipelineOutput {
            combined,
            reductions,
            linkage,
            colors,
            report: RunReport::default(),
        })
    }

    fn extract_stage(
        &self,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<Vec<DocumentTable>> {
        let mut tables = Vec::with_capacity(self.config.inputs.len());
        for folder in &self.config.inputs {
            cancel.check()?;
            let key = self.cache.key_with(CacheKey::table(&folder.dataset_name()), || {
                extraction_fingerprint(folder)
            })?;
            report.record_stage(&key, self.cache.contains::<DocumentTable>(&key));
            let table = self.cache.get_or_compute(&key, || {
                let (table, summary) = extract_folder(&self.registry, folder, cancel)?;
                report.record_extraction(summary);
                Ok(table)
            })?;
            report.datasets += 1;
            report.documents += table.documents.len();
            tables.push(table);
        }
        Ok(tables)
    }

    /// Embeds each dataset and concatenates them. Per-dataset matrices are
    /// only loaded when the combined artifact is missing.
    fn embed_stage(
        &mut self,
        tables: &[DocumentTable],
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<(EmbeddingMatrix, u32)> {
        let mut keys = Vec::with_capacity(tables.len());
        let mut combined_fingerprint = Fingerprint::new();
        for table in tables {
            let fingerprint = self
                .embedder
                .settings()
                .fingerprint(table_fingerprint(table))
                .finish();
            combined_fingerprint = combined_fingerprint.u64(u64::from(fingerprint));
            keys.push(self.cache.key(CacheKey::embeddings(&table.dataset), fingerprint));
        }
        let combined_fingerprint = combined_fingerprint.finish();
        let combined_key = self.cache.key(CacheKey::combined(), combined_fingerprint);

        cancel.check()?;
        let cache = &self.cache;
        let embedder = &mut self.embedder;
        report.record_stage(&combined_key, cache.contains::<EmbeddingMatrix>(&combined_key));
        let combined = cache.get_or_compute(&combined_key, || {
            let mut parts = Vec::with_capacity(tables.len());
            for (table, key) in tables.iter().zip(&keys) {
                cancel.check()?;
                report.record_stage(key, cache.contains::<EmbeddingMatrix>(key));
                let part = cache.get_or_compute(key, || embedder.embed_table(table, cancel))?;
                parts.push(part);
            }
            EmbeddingMatrix::concat(&parts)
        })?;
        Ok((combined, combined_fingerprint))
    }

    fn reduce_stage(
        &self,
        combined: &EmbeddingMatrix,
        combined_fingerprint: u32,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<Vec<ReducedMatrix>> {
        let degenerate = self.config.degenerate;
        let seed = self.config.seed;
        let mut reductions = Vec::new();
        for method in self.config.planned_reductions() {
            cancel.check()?;
            let label = method.to_string();
            let fingerprint = Fingerprint::new()
                .u64(u64::from(combined_fingerprint))
                .str(&label)
                .str(degenerate.as_str())
                .u64(seed)
                .finish();
            let key = self.cache.key(CacheKey::reduction(&label), fingerprint);
            report.record_stage(&key, self.cache.contains::<ReducedMatrix>(&key));
            let reduced = self
                .cache
                .get_or_compute(&key, || reduce(combined, method, degenerate, seed))?;
            ensure_rows(&reduced, combined, &self.cache.path_for::<ReducedMatrix>(&key))?;
            reductions.push(reduced);
        }
        Ok(reductions)
    }
}

/// Catches artifacts reused under a stale [`crate::KeyPolicy::Named`] key.
fn ensure_rows(reduced: &ReducedMatrix, combined: &EmbeddingMatrix, path: &Path) -> Result<()> {
    if reduced.coordinates.nrows() == combined.rows() {
        return Ok(());
    }
    Err(PipelineError::invalid_parameter(
        "cache",
        format!(
            "{} holds {} rows but the embeddings have {}; rerun with --force",
            path.display(),
            reduced.coordinates.nrows(),
            combined.rows()
        ),
    ))
}

/// Identity of a folder's inputs: accepted extensions plus every matching
/// file's path, size and modification time.
fn extraction_fingerprint(folder: &InputFolder) -> Result<u32> {
    let mut fingerprint = Fingerprint::new().str(&folder.extensions.join("+"));
    for path in discover(&folder.path, &folder.extensions)? {
        let metadata = fs::metadata(&path).map_err(|err| {
            PipelineError::ExtractionFailure(doc_extract::ExtractError::io(&path, err))
        })?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_nanos() as u64)
            .unwrap_or(0);
        fingerprint = fingerprint
            .str(&path.to_string_lossy())
            .u64(metadata.len())
            .u64(modified);
    }
    Ok(fingerprint.finish())
}

fn table_fingerprint(table: &DocumentTable) -> Fingerprint {
    let mut fingerprint = Fingerprint::new().str(&table.dataset);
    for document in &table.documents {
        fingerprint = fingerprint
            .str(&document.source_path.to_string_lossy())
            .str(&document.display_name)
            .str(&document.text);
        for (column, value) in &document.columns {
            fingerprint = fingerprint.str(column).str(value);
        }
    }
    fingerprint
}
