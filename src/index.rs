//! IVF-flat approximate nearest-neighbor index construction.
//!
//! The builder trains `nlist` coarse centroids with Lloyd's algorithm on a
//! deterministic subsample, then assigns every member vector to its nearest
//! centroid bucket. Searches probe a handful of buckets instead of the whole
//! collection. Small member sets fall back to a single exhaustive bucket:
//! approximate structures trained on too few points lose recall
//! unpredictably.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheError, CacheSection, ResultCache};
use crate::embeddings::SentenceEmbedding;
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::shards::{ShardId, TextShard};

/// Index families supported by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Exhaustive scan over every vector.
    Flat,
    /// Inverted-file index over trained centroid buckets.
    IvfFlat,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Flat => f.write_str("flat"),
            IndexKind::IvfFlat => f.write_str("ivf_flat"),
        }
    }
}

/// Training points required per centroid before IVF training is worthwhile.
pub const MIN_POINTS_PER_CENTROID: usize = 16;

const KMEANS_ITERATIONS: usize = 20;
const TRAIN_SUBSAMPLE_CAP: usize = 16_384;

/// Row-level reference back to a member shard sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorRef {
    /// Position of the owning shard in [`AnnIndex::members`].
    pub member: u16,
    /// Sentence index within that shard.
    pub sentence_index: u32,
}

/// Errors from index construction.
#[derive(Debug)]
pub enum IndexError {
    /// The member shard set contributed no vectors.
    NoVectors,
    /// Member embeddings disagree on vector dimension.
    DimensionMismatch {
        /// Dimension of the first vector seen.
        expected: usize,
        /// Conflicting dimension.
        actual: usize,
    },
    /// Too many member shards for the row encoding.
    TooManyMembers(usize),
    /// The result cache failed.
    Cache(CacheError),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::NoVectors => f.write_str("no vectors to index"),
            IndexError::DimensionMismatch { expected, actual } => {
                write!(f, "vector dimension mismatch: {actual} != {expected}")
            }
            IndexError::TooManyMembers(count) => {
                write!(f, "{count} member shards exceeds the index row encoding")
            }
            IndexError::Cache(err) => write!(f, "{err}"),
        }
    }
}

impl Error for IndexError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IndexError::Cache(err) => Some(err),
            _ => None,
        }
    }
}

/// Serialized ANN structure over one or more member shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnIndex {
    fingerprint: Fingerprint,
    kind: IndexKind,
    nlist: usize,
    dim: usize,
    members: Vec<ShardId>,
    centroids: Vec<Vec<f32>>,
    buckets: Vec<Vec<u32>>,
    ids: Vec<VectorRef>,
    vectors: Vec<Vec<f32>>,
}

impl AnnIndex {
    /// Cache fingerprint of this index.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Index family actually built (after any flat fallback).
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Number of centroid buckets (1 for flat).
    pub fn nlist(&self) -> usize {
        self.nlist
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Total indexed vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Member shards in canonical (sorted-by-id) order.
    pub fn members(&self) -> &[ShardId] {
        &self.members
    }

    /// Shard id and sentence index backing `row`.
    pub fn resolve(&self, row: u32) -> (&ShardId, u32) {
        let vector_ref = self.ids[row as usize];
        (
            &self.members[vector_ref.member as usize],
            vector_ref.sentence_index,
        )
    }

    /// Stored vector for `row`.
    pub(crate) fn vector(&self, row: u32) -> &[f32] {
        &self.vectors[row as usize]
    }

    /// Rows in bucket `bucket`.
    pub(crate) fn bucket(&self, bucket: usize) -> &[u32] {
        &self.buckets[bucket]
    }

    /// Bucket indices ordered by centroid distance to `query`.
    ///
    /// Flat indexes expose their single bucket. Ties order by bucket index
    /// so probe order is deterministic.
    pub(crate) fn probe_order(&self, query: &[f32]) -> Vec<usize> {
        if self.centroids.is_empty() {
            return vec![0];
        }
        let mut order: Vec<(f32, usize)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(idx, centroid)| (l2_distance(query, centroid), idx))
            .collect();
        order.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        order.into_iter().map(|(_, idx)| idx).collect()
    }
}

/// Euclidean distance between two vectors of equal dimension.
pub(crate) fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum.sqrt()
}

/// Fingerprint of an index over the given member shards and parameters.
///
/// Member fingerprints are sorted before hashing so the key is independent
/// of discovery order; two builds from identical inputs always collide onto
/// the same cache entry.
pub fn index_fingerprint(
    member_fingerprints: &[Fingerprint],
    kind: IndexKind,
    nlist: usize,
) -> Fingerprint {
    let mut sorted: Vec<Fingerprint> = member_fingerprints.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut builder = FingerprintBuilder::new("index");
    builder.push_str(&kind.to_string());
    builder.push_u64(nlist as u64);
    for fingerprint in &sorted {
        builder.push_fingerprint(fingerprint);
    }
    builder.finish()
}

/// Builds (or loads from the cache) an index over `shards`.
///
/// The cache is consulted before any training work; a hit deserializes the
/// stored blob and returns `(index, true)`. Corrupt entries are discarded
/// with a warning and rebuilt. `embeddings` must hold the rows of every
/// member shard; rows are arranged internally in (shard id, sentence index)
/// order so the built structure is independent of input ordering.
pub fn build_index(
    shards: &[TextShard],
    embeddings: &[SentenceEmbedding],
    requested: IndexKind,
    nlist: usize,
    cache: &ResultCache,
) -> Result<(AnnIndex, bool), IndexError> {
    let member_fingerprints: Vec<Fingerprint> =
        shards.iter().map(|shard| shard.fingerprint).collect();
    let key = index_fingerprint(&member_fingerprints, requested, nlist);

    match cache.load_blob::<AnnIndex>(CacheSection::Indexes, &key) {
        Ok(Some(index)) => return Ok((index, true)),
        Ok(None) => {}
        Err(err @ CacheError::Corruption { .. }) => {
            eprintln!("warning: {err}; rebuilding index");
            cache
                .discard(CacheSection::Indexes, &key)
                .map_err(IndexError::Cache)?;
        }
        Err(err) => return Err(IndexError::Cache(err)),
    }

    let index = train_index(&key, shards, embeddings, requested, nlist)?;
    cache
        .store_blob(CacheSection::Indexes, &key, &index)
        .map_err(IndexError::Cache)?;
    Ok((index, false))
}

fn train_index(
    key: &Fingerprint,
    shards: &[TextShard],
    embeddings: &[SentenceEmbedding],
    requested: IndexKind,
    nlist: usize,
) -> Result<AnnIndex, IndexError> {
    let mut members: Vec<ShardId> = shards.iter().map(|shard| shard.id.clone()).collect();
    members.sort();
    members.dedup();
    if members.len() > u16::MAX as usize {
        return Err(IndexError::TooManyMembers(members.len()));
    }
    let member_slots: HashMap<&ShardId, u16> = members
        .iter()
        .enumerate()
        .map(|(slot, id)| (id, slot as u16))
        .collect();

    // Group rows per member, then emit in canonical order.
    let mut grouped: Vec<Vec<&SentenceEmbedding>> = vec![Vec::new(); members.len()];
    for row in embeddings {
        if let Some(&slot) = member_slots.get(&row.shard_id) {
            grouped[slot as usize].push(row);
        }
    }

    let mut ids = Vec::new();
    let mut vectors: Vec<Vec<f32>> = Vec::new();
    let mut dim = 0usize;
    for (slot, mut rows) in grouped.into_iter().enumerate() {
        rows.sort_by_key(|row| row.sentence_index);
        for row in rows {
            if vectors.is_empty() {
                dim = row.vector.len();
            } else if row.vector.len() != dim {
                return Err(IndexError::DimensionMismatch {
                    expected: dim,
                    actual: row.vector.len(),
                });
            }
            ids.push(VectorRef {
                member: slot as u16,
                sentence_index: row.sentence_index,
            });
            vectors.push(row.vector.clone());
        }
    }
    if vectors.is_empty() {
        return Err(IndexError::NoVectors);
    }

    let use_ivf = requested == IndexKind::IvfFlat
        && nlist > 1
        && vectors.len() >= nlist * MIN_POINTS_PER_CENTROID;

    let (kind, centroids, buckets) = if use_ivf {
        let centroids = train_centroids(&vectors, nlist, dim);
        let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); centroids.len()];
        for (row, vector) in vectors.iter().enumerate() {
            let bucket = nearest_centroid(&centroids, vector);
            buckets[bucket].push(row as u32);
        }
        (IndexKind::IvfFlat, centroids, buckets)
    } else {
        let all: Vec<u32> = (0..vectors.len() as u32).collect();
        (IndexKind::Flat, Vec::new(), vec![all])
    };

    Ok(AnnIndex {
        fingerprint: *key,
        kind,
        nlist: buckets.len(),
        dim,
        members,
        centroids,
        buckets,
        ids,
        vectors,
    })
}

/// Lloyd's k-means over a deterministic stride subsample.
///
/// Initial centroids are evenly spaced sample points; ties during assignment
/// resolve to the lowest centroid index, so training is fully reproducible.
fn train_centroids(vectors: &[Vec<f32>], nlist: usize, dim: usize) -> Vec<Vec<f32>> {
    let sample = stride_sample(vectors, TRAIN_SUBSAMPLE_CAP);
    let mut centroids: Vec<Vec<f32>> = (0..nlist)
        .map(|i| sample[i * sample.len() / nlist].to_vec())
        .collect();

    for _ in 0..KMEANS_ITERATIONS {
        let mut sums = vec![vec![0.0f64; dim]; nlist];
        let mut counts = vec![0usize; nlist];
        for vector in &sample {
            let nearest = nearest_centroid(&centroids, vector);
            counts[nearest] += 1;
            for (sum, component) in sums[nearest].iter_mut().zip(vector.iter()) {
                *sum += f64::from(*component);
            }
        }
        for (slot, centroid) in centroids.iter_mut().enumerate() {
            if counts[slot] == 0 {
                // Empty cluster keeps its previous position.
                continue;
            }
            for (component, sum) in centroid.iter_mut().zip(&sums[slot]) {
                *component = (*sum / counts[slot] as f64) as f32;
            }
        }
    }
    centroids
}

fn stride_sample<'a>(vectors: &'a [Vec<f32>], cap: usize) -> Vec<&'a [f32]> {
    if vectors.len() <= cap {
        return vectors.iter().map(Vec::as_slice).collect();
    }
    (0..cap)
        .map(|i| vectors[i * vectors.len() / cap].as_slice())
        .collect()
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_distance = f32::INFINITY;
    for (idx, centroid) in centroids.iter().enumerate() {
        let distance = l2_distance(vector, centroid);
        if distance < best_distance {
            best = idx;
            best_distance = distance;
        }
    }
    best
}
