//! Candidate pair filtering and scoring over raw neighbor lists.
//!
//! Each configured metric scores a (query, neighbor) pair independently; a
//! pair survives only if every metric with positive weight passes its
//! threshold in its own direction. `distance` is lower-is-better, the other
//! metrics are higher-is-better, so tightening any threshold only ever
//! shrinks the surviving set.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::search::NeighborList;
use crate::shards::ShardId;

/// Name of the neighbor-concentration metric.
pub const METRIC_DENSITY: &str = "density";
/// Name of the raw embedding-distance metric.
pub const METRIC_DISTANCE: &str = "distance";
/// Name of the normalized edit-distance metric.
pub const METRIC_LEVENSHTEIN: &str = "levenshtein";
/// Name of the external readability-delta metric.
pub const METRIC_SIMPLICITY: &str = "simplicity";

/// Direction in which a metric's threshold applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Pass when the value is at least the threshold.
    HigherIsBetter,
    /// Pass when the value is at most the threshold.
    LowerIsBetter,
}

fn orientation(name: &str) -> Orientation {
    if name == METRIC_DISTANCE {
        Orientation::LowerIsBetter
    } else {
        Orientation::HigherIsBetter
    }
}

/// Weight and threshold for one named metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPolicy {
    /// Contribution to the combined score; zero disables thresholding too.
    pub weight: f64,
    /// Pass threshold, applied in the metric's orientation.
    pub threshold: f64,
}

/// Named metric policies; iteration order is stable (sorted by name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    metrics: BTreeMap<String, MetricPolicy>,
}

impl FilterConfig {
    /// An empty configuration (every neighbor passes).
    pub fn empty() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }

    /// Adds or replaces one metric policy.
    pub fn with_metric(mut self, name: &str, weight: f64, threshold: f64) -> Self {
        self.metrics
            .insert(name.to_string(), MetricPolicy { weight, threshold });
        self
    }

    /// Policy for `name`, if configured.
    pub fn metric(&self, name: &str) -> Option<&MetricPolicy> {
        self.metrics.get(name)
    }

    /// Configured metrics in name order.
    pub fn metrics(&self) -> impl Iterator<Item = (&str, &MetricPolicy)> {
        self.metrics
            .iter()
            .map(|(name, policy)| (name.as_str(), policy))
    }

    /// Canonical, filename-safe form used in pair cache keys.
    ///
    /// Stable across runs because the map iterates in name order.
    pub fn canonical_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.metrics.len());
        for (name, policy) in &self.metrics {
            parts.push(format!("{name}-w{}-t{}", policy.weight, policy.threshold));
        }
        parts.join("_")
    }
}

impl Default for FilterConfig {
    /// Mirrors the mining defaults: tight distance, some lexical difference
    /// required, simplicity recorded but not enforced.
    fn default() -> Self {
        Self::empty()
            .with_metric(METRIC_DENSITY, 1.0, 0.6)
            .with_metric(METRIC_DISTANCE, 1.0, 0.05)
            .with_metric(METRIC_LEVENSHTEIN, 1.0, 0.2)
            .with_metric(METRIC_SIMPLICITY, 0.0, 0.0)
    }
}

/// Cache key for a scored pair file.
pub fn pairs_fingerprint(
    query_fingerprint: &Fingerprint,
    db_fingerprints: &[Fingerprint],
    topk: usize,
    nprobe: usize,
    config: &FilterConfig,
) -> Fingerprint {
    let mut sorted: Vec<Fingerprint> = db_fingerprints.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut builder = FingerprintBuilder::new("pairs");
    builder.push_fingerprint(query_fingerprint);
    builder.push_u64(topk as u64);
    builder.push_u64(nprobe as u64);
    builder.push_str(&config.canonical_string());
    for fingerprint in &sorted {
        builder.push_fingerprint(fingerprint);
    }
    builder.finish()
}

/// External readability capability scoring how much simpler `target` reads
/// than `source`.
pub trait SimplicityScorer: Send + Sync {
    /// Positive values mean the target is simpler than the source.
    fn simplicity_delta(&self, source: &str, target: &str) -> f64;
}

/// One scored candidate paraphrase/simplification pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    /// Query-side sentence.
    pub source: String,
    /// Matched neighbor sentence.
    pub target: String,
    /// Per-metric values, kept for auditability.
    pub scores: BTreeMap<String, f64>,
    /// Weighted sum over the configured metrics.
    pub combined_score: f64,
}

/// Lowercases and collapses whitespace; the dedup normal form.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .to_lowercase()
}

/// Char-level edit distance divided by the longer length, in `[0, 1]`.
///
/// 0 means the strings are identical, 1 means nothing lines up; higher
/// values reward genuine lexical rewriting over near-copies.
pub fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 0.0;
    }
    levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Neighbor-concentration score in `[0, 1]`.
///
/// High when the candidate sits much closer than the query's average
/// neighbor, which marks a tight paraphrase cluster rather than an isolated
/// coincidence.
fn density_score(candidate_distance: f64, mean_distance: f64) -> f64 {
    if mean_distance == 0.0 {
        return if candidate_distance == 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - candidate_distance / mean_distance).clamp(0.0, 1.0)
}

fn passes(name: &str, value: f64, policy: &MetricPolicy) -> bool {
    match orientation(name) {
        Orientation::HigherIsBetter => value >= policy.threshold,
        Orientation::LowerIsBetter => value <= policy.threshold,
    }
}

fn goodness(name: &str, value: f64) -> f64 {
    match orientation(name) {
        Orientation::HigherIsBetter => value,
        Orientation::LowerIsBetter => (1.0 - value).max(0.0),
    }
}

/// Converts raw neighbor lists into scored candidate pairs.
///
/// `query_sentences` is the query shard's sentence sequence;
/// `db_sentences` maps each database shard to its sentences. Neighbors whose
/// text cannot be resolved are skipped. Pairs whose source and target are
/// identical after normalization are always rejected. Metrics with weight
/// zero are computed for the audit trail but never exclude; the simplicity
/// metric reports neutral (0.0, no thresholding) when no scorer is given.
pub fn score_and_filter(
    query_sentences: &[String],
    neighbor_lists: &[NeighborList],
    db_sentences: &HashMap<ShardId, Vec<String>>,
    config: &FilterConfig,
    simplicity: Option<&dyn SimplicityScorer>,
) -> Vec<CandidatePair> {
    let mut pairs = Vec::new();
    for list in neighbor_lists {
        let Some(source) = query_sentences.get(list.query_sentence_index as usize) else {
            continue;
        };
        let mean_distance = if list.neighbors.is_empty() {
            0.0
        } else {
            list.neighbors
                .iter()
                .map(|n| f64::from(n.distance))
                .sum::<f64>()
                / list.neighbors.len() as f64
        };

        for neighbor in &list.neighbors {
            let Some(target) = db_sentences
                .get(&neighbor.db_shard_id)
                .and_then(|sentences| sentences.get(neighbor.db_sentence_index as usize))
            else {
                continue;
            };
            if normalize_text(source) == normalize_text(target) {
                continue;
            }

            let mut scores = BTreeMap::new();
            let mut combined = 0.0f64;
            let mut keep = true;
            for (name, policy) in config.metrics() {
                let (value, enforce) = match name {
                    METRIC_DENSITY => {
                        (density_score(f64::from(neighbor.distance), mean_distance), true)
                    }
                    METRIC_DISTANCE => (f64::from(neighbor.distance), true),
                    METRIC_LEVENSHTEIN => (levenshtein_ratio(source, target), true),
                    METRIC_SIMPLICITY => match simplicity {
                        Some(scorer) => (scorer.simplicity_delta(source, target), true),
                        None => (0.0, false),
                    },
                    // Unknown metric names are recorded as neutral zeros so a
                    // config typo shows up in the audit trail instead of
                    // silently vanishing.
                    _ => (0.0, false),
                };
                scores.insert(name.to_string(), value);
                combined += policy.weight * goodness(name, value);
                if enforce && policy.weight > 0.0 && !passes(name, value, policy) {
                    keep = false;
                    break;
                }
            }
            if !keep {
                continue;
            }
            pairs.push(CandidatePair {
                source: source.clone(),
                target: target.clone(),
                scores,
                combined_score: combined,
            });
        }
    }
    pairs
}
