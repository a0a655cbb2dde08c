//! Pipeline configuration and the command-line interface that builds it.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::KeyPolicy;
use crate::cluster::LinkageMethod;
use crate::embedder::cohere::DEFAULT_BASE_URL;
use crate::embedder::{CohereEmbedder, EmbedSettings, RateLimit, Truncate};
use crate::error::{PipelineError, Result};
use crate::extract::InputFolder;
use crate::reduce::{DegeneratePolicy, ReductionAlgorithm, ReductionMethod, DEFAULT_SEED};

/// Reduced matrix and column window used for leaf colors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorSource {
    pub method: ReductionMethod,
    /// First of three consecutive columns mapped to red, green and blue.
    pub first_column: usize,
}

impl Default for ColorSource {
    fn default() -> Self {
        Self {
            method: ReductionMethod::new(ReductionAlgorithm::Pca, 5),
            first_column: 2,
        }
    }
}

/// Everything a pipeline run needs besides the embedding service.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub inputs: Vec<InputFolder>,
    pub output_dir: PathBuf,
    /// Recompute artifacts even when cached.
    pub force: bool,
    pub key_policy: KeyPolicy,
    pub embed: EmbedSettings,
    pub reductions: Vec<ReductionMethod>,
    pub color_source: ColorSource,
    pub degenerate: DegeneratePolicy,
    pub linkage: LinkageMethod,
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output_dir: PathBuf::from("output"),
            force: false,
            key_policy: KeyPolicy::default(),
            embed: EmbedSettings::default(),
            reductions: default_reductions(),
            color_source: ColorSource::default(),
            degenerate: DegeneratePolicy::default(),
            linkage: LinkageMethod::default(),
            seed: DEFAULT_SEED,
        }
    }
}

impl PipelineConfig {
    /// Rejects configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(PipelineError::invalid_parameter(
                "inputs",
                "at least one input folder is required",
            ));
        }
        let mut datasets: Vec<String> = self.inputs.iter().map(InputFolder::dataset_name).collect();
        datasets.sort();
        if let Some(pair) = datasets.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(PipelineError::invalid_parameter(
                "inputs",
                format!("two input folders share the dataset name '{}'", pair[0]),
            ));
        }
        if self.color_source.method.components < self.color_source.first_column + 3 {
            return Err(PipelineError::invalid_parameter(
                "color_source",
                format!(
                    "{} has no columns {}..{}",
                    self.color_source.method,
                    self.color_source.first_column,
                    self.color_source.first_column + 3
                ),
            ));
        }
        self.embed.validate()
    }

    /// Reductions to run, with the color source appended when missing.
    pub fn planned_reductions(&self) -> Vec<ReductionMethod> {
        let mut planned = self.reductions.clone();
        if !planned.contains(&self.color_source.method) {
            planned.push(self.color_source.method);
        }
        planned
    }
}

fn default_reductions() -> Vec<ReductionMethod> {
    vec![
        ReductionMethod::new(ReductionAlgorithm::Pca, 5),
        ReductionMethod::new(ReductionAlgorithm::Umap, 2),
        ReductionMethod::new(ReductionAlgorithm::Tsne, 2),
    ]
}

/// Command-line interface of the pipeline binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fractal-embeddings",
    about = "Embed document folders, reduce them and color their dendrogram"
)]
pub struct Cli {
    /// Input folders as ext[+ext]:path, e.g. md+txt:~/notes (repeatable or comma separated)
    #[arg(long = "input", env = "FRACTAL_INPUTS", value_delimiter = ',', required = true)]
    pub inputs: Vec<InputFolder>,

    /// Directory holding cached artifacts and outputs
    #[arg(long, env = "FRACTAL_OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,

    /// Recompute every stage even when its artifact exists
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Use plain dataset/method names as cache keys (no input fingerprints)
    #[arg(long, env = "FRACTAL_NAMED_KEYS", default_value_t = false)]
    pub named_keys: bool,

    /// Reductions to compute, comma separated
    #[arg(
        long,
        env = "FRACTAL_REDUCTIONS",
        value_delimiter = ',',
        default_value = "pca5,umap2,tsne2"
    )]
    pub reductions: Vec<ReductionMethod>,

    /// Reduction providing leaf colors
    #[arg(long, env = "FRACTAL_COLOR_METHOD", default_value = "pca5")]
    pub color_method: ReductionMethod,

    /// First of the three reduced columns used as RGB
    #[arg(long, env = "FRACTAL_COLOR_COLUMN", default_value_t = 2)]
    pub color_column: usize,

    /// Fail on constant reduced columns instead of filling them with 0.5
    #[arg(long, default_value_t = false)]
    pub strict_columns: bool,

    /// Seed for the reducers
    #[arg(long, env = "FRACTAL_SEED", default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    /// Maximum characters per chunk
    #[arg(long, env = "FRACTAL_CHUNK_SIZE", default_value_t = 512)]
    pub chunk_size: usize,

    /// Chunks per embedding call
    #[arg(long, env = "FRACTAL_BATCH_SIZE", default_value_t = 96)]
    pub batch_size: usize,

    /// Embedding calls allowed per window (0 disables limiting)
    #[arg(long, env = "FRACTAL_RATE_LIMIT_CALLS", default_value_t = 100)]
    pub rate_limit_calls: u32,

    /// Rate limit window in seconds
    #[arg(long, env = "FRACTAL_RATE_LIMIT_SECS", default_value_t = 60)]
    pub rate_limit_secs: u64,

    /// Cohere API key
    #[arg(long, env = "COHERE_API_KEY", hide_env_values = true)]
    pub cohere_api_key: Option<String>,

    /// Cohere embedding model
    #[arg(long, env = "FRACTAL_COHERE_MODEL", default_value = "embed-english-v3.0")]
    pub cohere_model: String,

    /// Cohere API root
    #[arg(long, env = "FRACTAL_COHERE_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub cohere_base_url: String,

    /// Cohere input type (empty to omit)
    #[arg(long, env = "FRACTAL_COHERE_INPUT_TYPE", default_value = "clustering")]
    pub cohere_input_type: String,

    /// HTTP timeout in seconds
    #[arg(long, env = "FRACTAL_COHERE_TIMEOUT_SECS", default_value_t = 60)]
    pub cohere_timeout_secs: u64,

    /// Where to write the colored dendrogram (defaults to <output-dir>/cluster_colors.json)
    #[arg(long, env = "FRACTAL_COLORS_OUT")]
    pub colors_out: Option<PathBuf>,
}

impl Cli {
    /// Converts the parsed CLI into a `PipelineConfig`.
    pub fn build_config(&self) -> PipelineConfig {
        PipelineConfig {
            inputs: self.inputs.clone(),
            output_dir: self.output_dir.clone(),
            force: self.force,
            key_policy: if self.named_keys {
                KeyPolicy::Named
            } else {
                KeyPolicy::Fingerprinted
            },
            embed: EmbedSettings {
                model: self.cohere_model.clone(),
                chunk_size: self.chunk_size,
                batch_size: self.batch_size,
                truncate: Truncate::End,
                rate_limit: RateLimit {
                    calls: self.rate_limit_calls,
                    per: Duration::from_secs(self.rate_limit_secs),
                },
            },
            reductions: self.reductions.clone(),
            color_source: ColorSource {
                method: self.color_method,
                first_column: self.color_column,
            },
            degenerate: if self.strict_columns {
                DegeneratePolicy::Fail
            } else {
                DegeneratePolicy::Midpoint
            },
            linkage: LinkageMethod::Ward,
            seed: self.seed,
        }
    }

    /// Builds the Cohere client from the CLI credentials.
    pub fn build_service(&self) -> Result<CohereEmbedder> {
        let api_key = self.cohere_api_key.as_deref().unwrap_or_default();
        CohereEmbedder::new(
            api_key,
            &self.cohere_base_url,
            Some(self.cohere_input_type.clone()),
            Duration::from_secs(self.cohere_timeout_secs),
        )
    }

    /// Destination of the dendrogram export.
    pub fn colors_path(&self) -> PathBuf {
        self.colors_out
            .clone()
            .unwrap_or_else(|| self.output_dir.join("cluster_colors.json"))
    }
}
