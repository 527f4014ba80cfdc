//! Sentence embedding rows and the cached embedding stage.

use std::error::Error;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheError, CacheSection, ResultCache};
use crate::embedder::{EmbedderError, SentenceEmbedder};
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::shards::{ShardId, TextShard};

/// One embedded sentence within its shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentenceEmbedding {
    /// Shard the sentence belongs to.
    pub shard_id: ShardId,
    /// Zero-based sentence position within the shard.
    pub sentence_index: u32,
    /// Model embedding vector.
    pub vector: Vec<f32>,
}

/// Errors from the embedding stage.
#[derive(Debug)]
pub enum EmbeddingStageError {
    /// The embedding backend failed.
    Embedder(EmbedderError),
    /// The result cache failed.
    Cache(CacheError),
}

impl fmt::Display for EmbeddingStageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingStageError::Embedder(err) => write!(f, "{err}"),
            EmbeddingStageError::Cache(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EmbeddingStageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EmbeddingStageError::Embedder(err) => Some(err),
            EmbeddingStageError::Cache(err) => Some(err),
        }
    }
}

/// Cache key for a shard's embeddings under one model and language.
pub fn embeddings_fingerprint(
    shard_fingerprint: &Fingerprint,
    language: &str,
    model_version: &str,
) -> Fingerprint {
    let mut builder = FingerprintBuilder::new("embeddings");
    builder.push_fingerprint(shard_fingerprint);
    builder.push_str(language);
    builder.push_str(model_version);
    builder.finish()
}

fn token_count(sentence: &str) -> usize {
    sentence.split_whitespace().count()
}

/// Plans embedding batches under a cumulative token budget.
///
/// Greedy in input order: a batch closes when adding the next sentence would
/// exceed `max_token_budget`. A single sentence over the budget occupies a
/// batch of its own rather than being dropped. Concatenating the returned
/// ranges reproduces `0..sentences.len()` exactly.
pub fn plan_batches(sentences: &[String], max_token_budget: usize) -> Vec<Range<usize>> {
    let budget = max_token_budget.max(1);
    let mut batches = Vec::new();
    if sentences.is_empty() {
        return batches;
    }
    let mut start = 0usize;
    let mut used = 0usize;
    for (idx, sentence) in sentences.iter().enumerate() {
        let tokens = token_count(sentence).max(1);
        if idx > start && used + tokens > budget {
            batches.push(start..idx);
            start = idx;
            used = 0;
        }
        used += tokens;
    }
    batches.push(start..sentences.len());
    batches
}

/// Embeds a shard's sentences, consulting the cache first.
///
/// The cache entry is keyed by `(shard fingerprint, language, model
/// version)`. Returns the embedding rows in sentence order plus whether they
/// came from the cache. A corrupt cache entry is discarded with a warning
/// and recomputed.
pub fn embed_shard(
    embedder: &dyn SentenceEmbedder,
    shard: &TextShard,
    sentences: &[String],
    language: &str,
    max_token_budget: usize,
    cache: &ResultCache,
) -> Result<(Vec<SentenceEmbedding>, bool), EmbeddingStageError> {
    let key = embeddings_fingerprint(&shard.fingerprint, language, embedder.model_version());
    match cache.load_blob::<Vec<SentenceEmbedding>>(CacheSection::Embeddings, &key) {
        Ok(Some(rows)) => return Ok((rows, true)),
        Ok(None) => {}
        Err(err @ CacheError::Corruption { .. }) => {
            eprintln!("warning: {err}; recomputing embeddings for shard {}", shard.id);
            cache
                .discard(CacheSection::Embeddings, &key)
                .map_err(EmbeddingStageError::Cache)?;
        }
        Err(err) => return Err(EmbeddingStageError::Cache(err)),
    }

    let mut rows = Vec::with_capacity(sentences.len());
    for range in plan_batches(sentences, max_token_budget) {
        let batch: Vec<&str> = sentences[range.clone()].iter().map(String::as_str).collect();
        let vectors = embedder
            .embed_batch(&batch, language)
            .map_err(EmbeddingStageError::Embedder)?;
        if vectors.len() != batch.len() {
            return Err(EmbeddingStageError::Embedder(EmbedderError::ShapeMismatch {
                expected: batch.len(),
                actual: vectors.len(),
            }));
        }
        for (offset, vector) in vectors.into_iter().enumerate() {
            rows.push(SentenceEmbedding {
                shard_id: shard.id.clone(),
                sentence_index: (range.start + offset) as u32,
                vector,
            });
        }
    }

    cache
        .store_blob(CacheSection::Embeddings, &key, &rows)
        .map_err(EmbeddingStageError::Cache)?;
    Ok((rows, false))
}
