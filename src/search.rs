//! Batched approximate kNN search of one shard against indexed shards.

use std::error::Error;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheError, CacheSection, ResultCache};
use crate::embeddings::SentenceEmbedding;
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::index::{l2_distance, AnnIndex};
use crate::shards::{ShardId, TextShard};

/// Queries scored together to amortize probe overhead. Grouping only affects
/// scheduling; results are a pure function of the query and parameters.
pub const SEARCH_BATCH_SIZE: usize = 256;

/// Single neighbor hit for a query sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Shard holding the matched sentence.
    pub db_shard_id: ShardId,
    /// Sentence index within that shard.
    pub db_sentence_index: u32,
    /// Euclidean embedding distance to the query.
    pub distance: f32,
}

/// Ordered neighbor set for one query sentence.
///
/// Holds at most `topk` neighbors in non-decreasing distance order; distance
/// ties order by `(db_shard_id, db_sentence_index)` ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborList {
    /// Shard the query sentence came from.
    pub query_shard_id: ShardId,
    /// Query sentence index within its shard.
    pub query_sentence_index: u32,
    /// Maximum neighbors retained.
    pub topk: usize,
    /// Centroid buckets probed per query.
    pub nprobe: usize,
    /// Neighbors, closest first.
    pub neighbors: Vec<Neighbor>,
}

/// Errors from the search stage.
#[derive(Debug)]
pub enum SearchError {
    /// The result cache failed.
    Cache(CacheError),
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::Cache(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SearchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SearchError::Cache(err) => Some(err),
        }
    }
}

/// Cache key for one search unit.
///
/// Database fingerprints are sorted so the key is independent of shard
/// discovery order.
pub fn nn_results_fingerprint(
    query_fingerprint: &Fingerprint,
    db_fingerprints: &[Fingerprint],
    topk: usize,
    nprobe: usize,
) -> Fingerprint {
    let mut sorted: Vec<Fingerprint> = db_fingerprints.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut builder = FingerprintBuilder::new("nn_results");
    builder.push_fingerprint(query_fingerprint);
    builder.push_u64(topk as u64);
    builder.push_u64(nprobe as u64);
    for fingerprint in &sorted {
        builder.push_fingerprint(fingerprint);
    }
    builder.finish()
}

/// Runs batched kNN for every sentence of `query_shard` against `index`.
///
/// The result cache is consulted first under the
/// `(query fingerprint, db fingerprints, topk, nprobe)` key; a hit skips all
/// computation, which is what makes reruns after a partial failure safe.
/// Returns one [`NeighborList`] per query sentence in sentence order, plus
/// whether the set came from the cache.
pub fn search(
    query_shard: &TextShard,
    query_embeddings: &[SentenceEmbedding],
    db_shards: &[TextShard],
    index: &AnnIndex,
    topk: usize,
    nprobe: usize,
    cache: &ResultCache,
) -> Result<(Vec<NeighborList>, bool), SearchError> {
    let db_fingerprints: Vec<Fingerprint> =
        db_shards.iter().map(|shard| shard.fingerprint).collect();
    let key = nn_results_fingerprint(&query_shard.fingerprint, &db_fingerprints, topk, nprobe);

    match cache.load_records::<NeighborList>(CacheSection::NnResults, &key) {
        Ok(Some(lists)) => return Ok((lists, true)),
        Ok(None) => {}
        Err(err @ CacheError::Corruption { .. }) => {
            eprintln!(
                "warning: {err}; recomputing neighbors for shard {}",
                query_shard.id
            );
            cache
                .discard(CacheSection::NnResults, &key)
                .map_err(SearchError::Cache)?;
        }
        Err(err) => return Err(SearchError::Cache(err)),
    }

    let mut ordered: Vec<&SentenceEmbedding> = query_embeddings.iter().collect();
    ordered.sort_by_key(|row| row.sentence_index);

    let mut lists = Vec::with_capacity(ordered.len());
    for batch in ordered.chunks(SEARCH_BATCH_SIZE) {
        let mut batch_lists: Vec<NeighborList> = batch
            .par_iter()
            .map(|row| search_one(index, &query_shard.id, row, topk, nprobe))
            .collect();
        lists.append(&mut batch_lists);
    }

    cache
        .store_records(CacheSection::NnResults, &key, &lists)
        .map_err(SearchError::Cache)?;
    Ok((lists, false))
}

fn search_one(
    index: &AnnIndex,
    query_shard_id: &ShardId,
    row: &SentenceEmbedding,
    topk: usize,
    nprobe: usize,
) -> NeighborList {
    let probes = index.probe_order(&row.vector);
    let mut hits: Vec<Neighbor> = Vec::new();
    for &bucket in probes.iter().take(nprobe.max(1)) {
        for &vector_row in index.bucket(bucket) {
            let (db_shard_id, db_sentence_index) = index.resolve(vector_row);
            // A sentence must never match itself when its shard is indexed.
            if db_shard_id == query_shard_id && db_sentence_index == row.sentence_index {
                continue;
            }
            hits.push(Neighbor {
                db_shard_id: db_shard_id.clone(),
                db_sentence_index,
                distance: l2_distance(&row.vector, index.vector(vector_row)),
            });
        }
    }
    hits.sort_by(neighbor_order);
    hits.truncate(topk);
    NeighborList {
        query_shard_id: query_shard_id.clone(),
        query_sentence_index: row.sentence_index,
        topk,
        nprobe,
        neighbors: hits,
    }
}

fn neighbor_order(a: &Neighbor, b: &Neighbor) -> std::cmp::Ordering {
    a.distance
        .partial_cmp(&b.distance)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.db_shard_id.cmp(&b.db_shard_id))
        .then_with(|| a.db_sentence_index.cmp(&b.db_sentence_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{build_index, IndexKind};
    use crate::shards::fingerprint_sentences;
    use std::path::PathBuf;

    fn shard(id: &str, sentences: &[&str]) -> TextShard {
        let owned: Vec<String> = sentences.iter().map(|s| s.to_string()).collect();
        TextShard {
            id: ShardId::new(id),
            source_path: PathBuf::from(format!("{id}.txt")),
            fingerprint: fingerprint_sentences(&owned),
            sentence_count: owned.len(),
        }
    }

    fn rows(id: &str, vectors: &[[f32; 2]]) -> Vec<SentenceEmbedding> {
        vectors
            .iter()
            .enumerate()
            .map(|(idx, vector)| SentenceEmbedding {
                shard_id: ShardId::new(id),
                sentence_index: idx as u32,
                vector: vector.to_vec(),
            })
            .collect()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: ResultCache,
        shards: Vec<TextShard>,
        embeddings: Vec<SentenceEmbedding>,
        index: AnnIndex,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResultCache::open(dir.path()).expect("cache");
        let shards = vec![
            shard("q", &["a", "b", "c"]),
            shard("db", &["x", "y"]),
        ];
        let mut embeddings = rows("q", &[[0.0, 0.0], [5.0, 5.0], [9.0, 9.0]]);
        embeddings.extend(rows("db", &[[0.1, 0.0], [5.0, 5.1]]));
        let (index, _) =
            build_index(&shards, &embeddings, IndexKind::Flat, 1, &cache).expect("index");
        Fixture {
            _dir: dir,
            cache,
            shards,
            embeddings,
            index,
        }
    }

    fn query_rows(fixture: &Fixture) -> Vec<SentenceEmbedding> {
        fixture
            .embeddings
            .iter()
            .filter(|row| row.shard_id == ShardId::new("q"))
            .cloned()
            .collect()
    }

    #[test]
    fn lists_respect_topk_and_distance_order() {
        let fixture = fixture();
        let queries = query_rows(&fixture);
        let (lists, from_cache) = search(
            &fixture.shards[0],
            &queries,
            &fixture.shards,
            &fixture.index,
            2,
            1,
            &fixture.cache,
        )
        .expect("search");
        assert!(!from_cache);
        assert_eq!(lists.len(), 3);
        for list in &lists {
            assert!(list.neighbors.len() <= 2);
            for window in list.neighbors.windows(2) {
                assert!(window[0].distance <= window[1].distance);
            }
        }
        // Closest match for query 0 is db sentence 0 at distance 0.1.
        assert_eq!(lists[0].neighbors[0].db_shard_id, ShardId::new("db"));
        assert_eq!(lists[0].neighbors[0].db_sentence_index, 0);
    }

    #[test]
    fn queries_never_match_themselves() {
        let fixture = fixture();
        let queries = query_rows(&fixture);
        let (lists, _) = search(
            &fixture.shards[0],
            &queries,
            &fixture.shards,
            &fixture.index,
            10,
            1,
            &fixture.cache,
        )
        .expect("search");
        for list in &lists {
            assert!(!list.neighbors.iter().any(|n| {
                n.db_shard_id == list.query_shard_id
                    && n.db_sentence_index == list.query_sentence_index
            }));
        }
    }

    #[test]
    fn repeated_search_hits_the_cache() {
        let fixture = fixture();
        let queries = query_rows(&fixture);
        let (first, from_cache) = search(
            &fixture.shards[0],
            &queries,
            &fixture.shards,
            &fixture.index,
            2,
            1,
            &fixture.cache,
        )
        .expect("search");
        assert!(!from_cache);
        let (second, from_cache) = search(
            &fixture.shards[0],
            &queries,
            &fixture.shards,
            &fixture.index,
            2,
            1,
            &fixture.cache,
        )
        .expect("cached search");
        assert!(from_cache);
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].neighbors, second[0].neighbors);
    }

    #[test]
    fn cache_key_is_order_insensitive_but_parameter_sensitive() {
        let a = Fingerprint::of_bytes(b"a");
        let b = Fingerprint::of_bytes(b"b");
        let q = Fingerprint::of_bytes(b"q");
        assert_eq!(
            nn_results_fingerprint(&q, &[a, b], 8, 16),
            nn_results_fingerprint(&q, &[b, a], 8, 16)
        );
        assert_ne!(
            nn_results_fingerprint(&q, &[a, b], 8, 16),
            nn_results_fingerprint(&q, &[a, b], 4, 16)
        );
    }

    #[test]
    fn distance_ties_break_by_shard_then_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResultCache::open(dir.path()).expect("cache");
        let shards = vec![shard("q", &["a"]), shard("z", &["x", "y"])];
        // Both db vectors sit at the same distance from the query.
        let mut embeddings = rows("q", &[[0.0, 0.0]]);
        embeddings.extend(rows("z", &[[1.0, 0.0], [0.0, 1.0]]));
        let (index, _) =
            build_index(&shards, &embeddings, IndexKind::Flat, 1, &cache).expect("index");
        let queries = rows("q", &[[0.0, 0.0]]);
        let (lists, _) =
            search(&shards[0], &queries, &shards, &index, 2, 1, &cache).expect("search");
        let neighbors = &lists[0].neighbors;
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].db_sentence_index, 0);
        assert_eq!(neighbors[1].db_sentence_index, 1);
    }
}
