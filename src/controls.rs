//! Mining configuration and the command-line surface shared by binaries.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::filtering::{
    FilterConfig, METRIC_DENSITY, METRIC_DISTANCE, METRIC_LEVENSHTEIN, METRIC_SIMPLICITY,
};
use crate::index::IndexKind;

/// Tunable knobs threaded through every pipeline stage.
///
/// An explicit value rather than ambient state, so several configurations
/// can coexist in one process.
#[derive(Debug, Clone, PartialEq)]
pub struct MiningControls {
    language: String,
    topk: usize,
    nprobe: usize,
    nlist: usize,
    index_kind: IndexKind,
    max_token_budget: usize,
    workers: usize,
    filter: FilterConfig,
}

impl MiningControls {
    /// Constructs and validates a new set of mining controls.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        language: String,
        topk: usize,
        nprobe: usize,
        nlist: usize,
        index_kind: IndexKind,
        max_token_budget: usize,
        workers: usize,
        filter: FilterConfig,
    ) -> Result<Self, ControlsError> {
        if topk == 0 {
            return Err(ControlsError::ZeroTopk);
        }
        if nprobe == 0 {
            return Err(ControlsError::ZeroNprobe);
        }
        if nprobe > nlist {
            return Err(ControlsError::NprobeExceedsNlist { nprobe, nlist });
        }
        if max_token_budget == 0 {
            return Err(ControlsError::ZeroTokenBudget);
        }
        Ok(Self {
            language,
            topk,
            nprobe,
            nlist,
            index_kind,
            max_token_budget,
            workers: workers.max(1),
            filter,
        })
    }

    /// Language code forwarded to the embedding service.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Maximum neighbors retained per query sentence.
    pub fn topk(&self) -> usize {
        self.topk
    }

    /// Centroid buckets probed per query.
    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    /// Centroid buckets trained per index.
    pub fn nlist(&self) -> usize {
        self.nlist
    }

    /// Requested index family.
    pub fn index_kind(&self) -> IndexKind {
        self.index_kind
    }

    /// Cumulative token cap per embedding batch.
    pub fn max_token_budget(&self) -> usize {
        self.max_token_budget
    }

    /// Worker threads for pipeline units.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Metric weights and thresholds for candidate filtering.
    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }
}

impl Default for MiningControls {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            topk: 8,
            nprobe: 16,
            nlist: 256,
            index_kind: IndexKind::IvfFlat,
            max_token_budget: 1000,
            workers: default_workers(),
            filter: FilterConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Errors from mining-control validation.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlsError {
    /// `topk` must be at least 1.
    ZeroTopk,
    /// `nprobe` must be at least 1.
    ZeroNprobe,
    /// `nprobe` cannot exceed the trained cluster count.
    NprobeExceedsNlist {
        /// Requested probe count.
        nprobe: usize,
        /// Configured cluster count.
        nlist: usize,
    },
    /// The embedding token budget must be at least 1.
    ZeroTokenBudget,
}

impl fmt::Display for ControlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlsError::ZeroTopk => f.write_str("topk must be at least 1"),
            ControlsError::ZeroNprobe => f.write_str("nprobe must be at least 1"),
            ControlsError::NprobeExceedsNlist { nprobe, nlist } => {
                write!(f, "nprobe {nprobe} exceeds nlist {nlist}")
            }
            ControlsError::ZeroTokenBudget => {
                f.write_str("max token budget must be at least 1")
            }
        }
    }
}

impl Error for ControlsError {}

/// Index family selector for the command line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum IndexKindArg {
    /// Exhaustive scan, no training.
    Flat,
    /// Inverted-file index over trained centroids (default).
    IvfFlat,
}

impl From<IndexKindArg> for IndexKind {
    fn from(arg: IndexKindArg) -> Self {
        match arg {
            IndexKindArg::Flat => IndexKind::Flat,
            IndexKindArg::IvfFlat => IndexKind::IvfFlat,
        }
    }
}

/// Command-line interface shared by binaries that run the mining pipeline.
#[derive(Parser, Debug, Clone)]
#[command(name = "paramine", about = "Paraphrase mining pipeline controls")]
pub struct Cli {
    /// Directory of corpus text shards (one sentence per line)
    #[arg(long, env = "PARAMINE_CORPUS", default_value = "data/corpus")]
    pub corpus_root: PathBuf,

    /// Result cache directory
    #[arg(long, env = "PARAMINE_CACHE", default_value = "data/cache")]
    pub cache_dir: PathBuf,

    /// Language code forwarded to the embedding service
    #[arg(long, env = "PARAMINE_LANGUAGE", default_value = "en")]
    pub language: String,

    /// Neighbors retained per query sentence
    #[arg(long, env = "PARAMINE_TOPK", default_value_t = 8)]
    pub topk: usize,

    /// Centroid buckets probed per query
    #[arg(long, env = "PARAMINE_NPROBE", default_value_t = 16)]
    pub nprobe: usize,

    /// Centroid buckets trained per index
    #[arg(long, env = "PARAMINE_NLIST", default_value_t = 256)]
    pub nlist: usize,

    /// Index family to build
    #[arg(long, env = "PARAMINE_INDEX_KIND", value_enum, default_value = "ivf-flat")]
    pub index_kind: IndexKindArg,

    /// Cumulative token cap per embedding batch
    #[arg(long, env = "PARAMINE_TOKEN_BUDGET", default_value_t = 1000)]
    pub max_token_budget: usize,

    /// Worker threads for pipeline units (0 = number of CPUs)
    #[arg(long, env = "PARAMINE_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Base URL of the embedding server
    #[arg(long, env = "PARAMINE_EMBED_SERVER", default_value = "http://127.0.0.1:8090")]
    pub embedding_server: String,

    /// Embedding model version (part of the embedding cache key)
    #[arg(long, env = "PARAMINE_MODEL_VERSION", default_value = "laser2")]
    pub model_version: String,

    /// Seconds to wait for each embedding request
    #[arg(long, env = "PARAMINE_EMBED_TIMEOUT_SECS", default_value_t = 120)]
    pub embed_timeout_secs: u64,

    /// Name of the final dataset artifact
    #[arg(long, env = "PARAMINE_DATASET", default_value = "mined_pairs")]
    pub dataset: String,

    /// Density metric weight
    #[arg(long, default_value_t = 1.0)]
    pub density_weight: f64,

    /// Density metric threshold (higher is better)
    #[arg(long, default_value_t = 0.6)]
    pub density_threshold: f64,

    /// Distance metric weight
    #[arg(long, default_value_t = 1.0)]
    pub distance_weight: f64,

    /// Distance metric threshold (lower is better)
    #[arg(long, default_value_t = 0.05)]
    pub distance_threshold: f64,

    /// Levenshtein metric weight
    #[arg(long, default_value_t = 1.0)]
    pub levenshtein_weight: f64,

    /// Levenshtein metric threshold (higher is better)
    #[arg(long, default_value_t = 0.2)]
    pub levenshtein_threshold: f64,

    /// Simplicity metric weight (0 records without enforcing)
    #[arg(long, default_value_t = 0.0)]
    pub simplicity_weight: f64,

    /// Simplicity metric threshold (higher is better)
    #[arg(long, default_value_t = 0.0)]
    pub simplicity_threshold: f64,
}

impl Cli {
    /// Converts the parsed CLI into validated [`MiningControls`].
    pub fn build_controls(&self) -> Result<MiningControls, ControlsError> {
        let workers = if self.workers == 0 {
            default_workers()
        } else {
            self.workers
        };
        MiningControls::new(
            self.language.clone(),
            self.topk,
            self.nprobe,
            self.nlist,
            self.index_kind.into(),
            self.max_token_budget,
            workers,
            self.build_filter(),
        )
    }

    /// Filter configuration assembled from the metric arguments.
    pub fn build_filter(&self) -> FilterConfig {
        FilterConfig::empty()
            .with_metric(METRIC_DENSITY, self.density_weight, self.density_threshold)
            .with_metric(
                METRIC_DISTANCE,
                self.distance_weight,
                self.distance_threshold,
            )
            .with_metric(
                METRIC_LEVENSHTEIN,
                self.levenshtein_weight,
                self.levenshtein_threshold,
            )
            .with_metric(
                METRIC_SIMPLICITY,
                self.simplicity_weight,
                self.simplicity_threshold,
            )
    }

    /// Timeout applied to each embedding request.
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let controls = MiningControls::default();
        assert_eq!(controls.topk(), 8);
        assert_eq!(controls.nprobe(), 16);
        assert!(controls.nprobe() <= controls.nlist());
    }

    #[test]
    fn nprobe_above_nlist_is_rejected() {
        let err = MiningControls::new(
            "en".to_string(),
            8,
            32,
            16,
            IndexKind::IvfFlat,
            1000,
            4,
            FilterConfig::default(),
        )
        .expect_err("validation fails");
        assert_eq!(
            err,
            ControlsError::NprobeExceedsNlist {
                nprobe: 32,
                nlist: 16
            }
        );
    }

    #[test]
    fn zero_topk_is_rejected() {
        let err = MiningControls::new(
            "en".to_string(),
            0,
            1,
            1,
            IndexKind::Flat,
            1000,
            4,
            FilterConfig::default(),
        )
        .expect_err("validation fails");
        assert_eq!(err, ControlsError::ZeroTopk);
    }

    #[test]
    fn cli_builds_controls_and_filter() {
        let cli = Cli::parse_from([
            "paramine",
            "--topk",
            "4",
            "--nprobe",
            "2",
            "--nlist",
            "8",
            "--distance-threshold",
            "0.3",
        ]);
        let controls = cli.build_controls().expect("valid controls");
        assert_eq!(controls.topk(), 4);
        assert_eq!(controls.nprobe(), 2);
        let policy = controls
            .filter()
            .metric(METRIC_DISTANCE)
            .expect("distance configured");
        assert_eq!(policy.threshold, 0.3);
    }
}
