//! End-to-end mining run over a local worker pool.
//!
//! Units of work (embed one shard; search one query shard against the
//! indexed corpus) are independent, so they fan out over a task/result
//! channel pair and share nothing but the result cache. A failed unit is
//! recorded and skipped; it never aborts sibling units.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::bounded;
use serde::Serialize;

use crate::cache::{CacheError, CacheSection, ResultCache};
use crate::controls::MiningControls;
use crate::dataset::aggregate;
use crate::embedder::SentenceEmbedder;
use crate::embeddings::{embed_shard, SentenceEmbedding};
use crate::filtering::{pairs_fingerprint, score_and_filter, CandidatePair, SimplicityScorer};
use crate::index::{build_index, AnnIndex, IndexError};
use crate::search::search;
use crate::shards::{list_shards, load_sentences, ShardError, ShardId, TextShard};

/// Outcome counts for one pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    /// Units satisfied by an existing cache entry.
    pub from_cache: usize,
    /// Units computed fresh this run.
    pub computed: usize,
    /// Units that failed and were skipped.
    pub failed: usize,
}

#[derive(Default)]
struct StageCounters {
    from_cache: AtomicUsize,
    computed: AtomicUsize,
    failed: AtomicUsize,
}

impl StageCounters {
    fn record(&self, from_cache: bool) {
        if from_cache {
            self.from_cache.fetch_add(1, Ordering::Relaxed);
        } else {
            self.computed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StageCounts {
        StageCounts {
            from_cache: self.from_cache.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Per-stage outcomes and the final artifact location for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Shards discovered under the corpus root.
    pub shards_discovered: usize,
    /// Corpus files skipped during discovery.
    pub shards_skipped: usize,
    /// Embedding stage outcomes.
    pub embeddings: StageCounts,
    /// Index build outcomes.
    pub indexes: StageCounts,
    /// kNN search outcomes.
    pub searches: StageCounts,
    /// Scored pair file outcomes.
    pub pair_files: StageCounts,
    /// Pairs in the final deduplicated dataset.
    pub dataset_pairs: usize,
    /// Location of the written dataset artifact.
    pub dataset_path: PathBuf,
}

impl RunReport {
    /// Prints the run summary to stdout.
    pub fn print(&self) {
        println!("--- mining report ---");
        println!(
            "shards: {} discovered, {} skipped",
            self.shards_discovered, self.shards_skipped
        );
        for (stage, counts) in [
            ("embeddings", &self.embeddings),
            ("indexes", &self.indexes),
            ("searches", &self.searches),
            ("pair files", &self.pair_files),
        ] {
            println!(
                "{stage}: {} from cache, {} computed, {} failed",
                counts.from_cache, counts.computed, counts.failed
            );
        }
        println!(
            "dataset: {} pairs -> {}",
            self.dataset_pairs,
            self.dataset_path.display()
        );
    }
}

/// Errors that abort an entire run.
///
/// Per-unit failures never show up here; they are counted in the report and
/// the run continues without the failed unit.
#[derive(Debug)]
pub enum PipelineError {
    /// Corpus discovery failed (including the empty-corpus case).
    Shard(ShardError),
    /// Index construction failed.
    Index(IndexError),
    /// The result cache failed outside any isolatable unit.
    Cache(CacheError),
    /// Every shard failed the embedding stage.
    AllShardsFailed,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Shard(err) => write!(f, "{err}"),
            PipelineError::Index(err) => write!(f, "{err}"),
            PipelineError::Cache(err) => write!(f, "{err}"),
            PipelineError::AllShardsFailed => {
                f.write_str("every shard failed the embedding stage")
            }
        }
    }
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PipelineError::Shard(err) => Some(err),
            PipelineError::Index(err) => Some(err),
            PipelineError::Cache(err) => Some(err),
            PipelineError::AllShardsFailed => None,
        }
    }
}

struct EmbeddedShard {
    shard: TextShard,
    sentences: Vec<String>,
    rows: Vec<SentenceEmbedding>,
}

/// Runs the full mining pipeline and writes the named dataset artifact.
///
/// Every stage consults the result cache before computing, so re-invoking
/// with identical inputs and controls is a sequence of cache hits.
pub fn run(
    corpus_root: &Path,
    cache: &ResultCache,
    controls: &MiningControls,
    embedder: &dyn SentenceEmbedder,
    simplicity: Option<&dyn SimplicityScorer>,
    dataset_name: &str,
) -> Result<RunReport, PipelineError> {
    let scan = list_shards(corpus_root).map_err(PipelineError::Shard)?;
    for err in &scan.skipped {
        eprintln!("warning: skipping shard: {err}");
    }
    eprintln!(
        "mining {} shards with {} workers...",
        scan.shards.len(),
        controls.workers()
    );

    let embedding_counts = StageCounters::default();
    let embedded = embed_stage(&scan.shards, cache, controls, embedder, &embedding_counts);
    if embedded.is_empty() {
        return Err(PipelineError::AllShardsFailed);
    }

    let db_shards: Vec<TextShard> = embedded.iter().map(|unit| unit.shard.clone()).collect();
    let all_rows: Vec<SentenceEmbedding> = embedded
        .iter()
        .flat_map(|unit| unit.rows.iter().cloned())
        .collect();
    let index_counts = StageCounters::default();
    let (index, index_cached) = build_index(
        &db_shards,
        &all_rows,
        controls.index_kind(),
        controls.nlist(),
        cache,
    )
    .map_err(PipelineError::Index)?;
    index_counts.record(index_cached);
    eprintln!(
        "index over {} vectors ({}, {} buckets){}",
        index.len(),
        index.kind(),
        index.nlist(),
        if index_cached { " [cached]" } else { "" }
    );

    let sentence_map: HashMap<ShardId, Vec<String>> = embedded
        .iter()
        .map(|unit| (unit.shard.id.clone(), unit.sentences.clone()))
        .collect();

    let search_counts = StageCounters::default();
    let pair_counts = StageCounters::default();
    let unit_pairs = mine_stage(
        &embedded,
        &db_shards,
        &index,
        &sentence_map,
        cache,
        controls,
        simplicity,
        &search_counts,
        &pair_counts,
    );

    let dataset = aggregate(unit_pairs);
    let dataset_path = cache
        .store_named_records(CacheSection::Datasets, dataset_name, dataset.pairs())
        .map_err(PipelineError::Cache)?;

    Ok(RunReport {
        shards_discovered: scan.shards.len(),
        shards_skipped: scan.skipped.len(),
        embeddings: embedding_counts.snapshot(),
        indexes: index_counts.snapshot(),
        searches: search_counts.snapshot(),
        pair_files: pair_counts.snapshot(),
        dataset_pairs: dataset.len(),
        dataset_path,
    })
}

fn embed_stage(
    shards: &[TextShard],
    cache: &ResultCache,
    controls: &MiningControls,
    embedder: &dyn SentenceEmbedder,
    counters: &StageCounters,
) -> Vec<EmbeddedShard> {
    let workers = controls.workers().min(shards.len()).max(1);
    let (task_tx, task_rx) = bounded::<&TextShard>(shards.len().max(1));
    let (result_tx, result_rx) = bounded::<Option<EmbeddedShard>>(shards.len().max(1));

    let mut embedded = thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for shard in task_rx.iter() {
                    let outcome = embed_unit(shard, cache, controls, embedder, counters);
                    let sent = match outcome {
                        Ok(unit) => result_tx.send(Some(unit)),
                        Err(message) => {
                            eprintln!(
                                "warning: shard {} failed embedding: {message}",
                                shard.id
                            );
                            counters.record_failure();
                            result_tx.send(None)
                        }
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);
        drop(result_tx);

        for shard in shards {
            if task_tx.send(shard).is_err() {
                break;
            }
        }
        drop(task_tx);

        result_rx.iter().flatten().collect::<Vec<EmbeddedShard>>()
    });

    // Canonical processing order, independent of worker completion order.
    embedded.sort_by(|a, b| a.shard.id.cmp(&b.shard.id));
    embedded
}

fn embed_unit(
    shard: &TextShard,
    cache: &ResultCache,
    controls: &MiningControls,
    embedder: &dyn SentenceEmbedder,
    counters: &StageCounters,
) -> Result<EmbeddedShard, String> {
    let sentences = load_sentences(shard).map_err(|err| err.to_string())?;
    let (rows, from_cache) = embed_shard(
        embedder,
        shard,
        &sentences,
        controls.language(),
        controls.max_token_budget(),
        cache,
    )
    .map_err(|err| err.to_string())?;
    counters.record(from_cache);
    crate::debug_log!(
        "embedded shard {} ({} sentences, cached: {from_cache})",
        shard.id,
        sentences.len()
    );
    Ok(EmbeddedShard {
        shard: shard.clone(),
        sentences,
        rows,
    })
}

#[allow(clippy::too_many_arguments)]
fn mine_stage(
    embedded: &[EmbeddedShard],
    db_shards: &[TextShard],
    index: &AnnIndex,
    sentence_map: &HashMap<ShardId, Vec<String>>,
    cache: &ResultCache,
    controls: &MiningControls,
    simplicity: Option<&dyn SimplicityScorer>,
    search_counts: &StageCounters,
    pair_counts: &StageCounters,
) -> Vec<Vec<CandidatePair>> {
    let workers = controls.workers().min(embedded.len()).max(1);
    let (task_tx, task_rx) = bounded::<(usize, &EmbeddedShard)>(embedded.len().max(1));
    let (result_tx, result_rx) =
        bounded::<Option<(usize, Vec<CandidatePair>)>>(embedded.len().max(1));

    let mut tagged = thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for (position, unit) in task_rx.iter() {
                    let outcome = mine_unit(
                        unit,
                        db_shards,
                        index,
                        sentence_map,
                        cache,
                        controls,
                        simplicity,
                        search_counts,
                        pair_counts,
                    );
                    let sent = match outcome {
                        Ok(pairs) => result_tx.send(Some((position, pairs))),
                        Err(message) => {
                            eprintln!(
                                "warning: shard {} failed mining: {message}",
                                unit.shard.id
                            );
                            pair_counts.record_failure();
                            result_tx.send(None)
                        }
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);
        drop(result_tx);

        for task in embedded.iter().enumerate() {
            if task_tx.send(task).is_err() {
                break;
            }
        }
        drop(task_tx);

        result_rx
            .iter()
            .flatten()
            .collect::<Vec<(usize, Vec<CandidatePair>)>>()
    });

    // Aggregation breaks score ties by earliest shard-processing order, so
    // feed it units in their canonical positions.
    tagged.sort_by_key(|(position, _)| *position);
    tagged.into_iter().map(|(_, pairs)| pairs).collect()
}

#[allow(clippy::too_many_arguments)]
fn mine_unit(
    unit: &EmbeddedShard,
    db_shards: &[TextShard],
    index: &AnnIndex,
    sentence_map: &HashMap<ShardId, Vec<String>>,
    cache: &ResultCache,
    controls: &MiningControls,
    simplicity: Option<&dyn SimplicityScorer>,
    search_counts: &StageCounters,
    pair_counts: &StageCounters,
) -> Result<Vec<CandidatePair>, String> {
    let db_fingerprints: Vec<_> = db_shards.iter().map(|shard| shard.fingerprint).collect();
    let pairs_key = pairs_fingerprint(
        &unit.shard.fingerprint,
        &db_fingerprints,
        controls.topk(),
        controls.nprobe(),
        controls.filter(),
    );

    match cache.load_records::<CandidatePair>(CacheSection::Pairs, &pairs_key) {
        Ok(Some(pairs)) => {
            pair_counts.record(true);
            return Ok(pairs);
        }
        Ok(None) => {}
        Err(err @ CacheError::Corruption { .. }) => {
            eprintln!(
                "warning: {err}; recomputing pairs for shard {}",
                unit.shard.id
            );
            cache
                .discard(CacheSection::Pairs, &pairs_key)
                .map_err(|err| err.to_string())?;
        }
        Err(err) => return Err(err.to_string()),
    }

    let (lists, search_cached) = search(
        &unit.shard,
        &unit.rows,
        db_shards,
        index,
        controls.topk(),
        controls.nprobe(),
        cache,
    )
    .map_err(|err| err.to_string())?;
    search_counts.record(search_cached);

    let pairs = score_and_filter(
        &unit.sentences,
        &lists,
        sentence_map,
        controls.filter(),
        simplicity,
    );
    cache
        .store_records(CacheSection::Pairs, &pairs_key, &pairs)
        .map_err(|err| err.to_string())?;
    pair_counts.record(false);
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::EmbedderError;
    use crate::filtering::{FilterConfig, METRIC_DISTANCE, METRIC_LEVENSHTEIN};
    use crate::index::IndexKind;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic embedder: maps known sentences to fixed 2-d vectors.
    struct TableEmbedder {
        calls: AtomicUsize,
    }

    impl TableEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        fn vector_for(sentence: &str) -> Vec<f32> {
            match sentence {
                "Despite the complexity, she finished quickly." => vec![0.0, 0.0],
                "She finished fast despite the difficulty." => vec![0.1, 0.0],
                "A completely unrelated statement." => vec![9.0, 9.0],
                other => {
                    let len = other.chars().count() as f32;
                    vec![len, len * 0.5]
                }
            }
        }
    }

    impl SentenceEmbedder for TableEmbedder {
        fn embed_batch(
            &self,
            sentences: &[&str],
            _language: &str,
        ) -> Result<Vec<Vec<f32>>, EmbedderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(sentences.iter().map(|s| Self::vector_for(s)).collect())
        }

        fn model_version(&self) -> &str {
            "table-1"
        }
    }

    fn controls(filter: FilterConfig) -> MiningControls {
        MiningControls::new(
            "en".to_string(),
            1,
            1,
            4,
            IndexKind::Flat,
            1000,
            2,
            filter,
        )
        .expect("valid controls")
    }

    fn example_filter() -> FilterConfig {
        FilterConfig::empty()
            .with_metric(METRIC_DISTANCE, 1.0, 0.3)
            .with_metric(METRIC_LEVENSHTEIN, 1.0, 0.3)
    }

    fn write_example_corpus(root: &Path) {
        fs::create_dir_all(root).expect("corpus dir");
        fs::write(
            root.join("a.txt"),
            "Despite the complexity, she finished quickly.\n",
        )
        .expect("write a");
        fs::write(
            root.join("b.txt"),
            "She finished fast despite the difficulty.\n",
        )
        .expect("write b");
        fs::write(root.join("c.txt"), "A completely unrelated statement.\n")
            .expect("write c");
    }

    #[test]
    fn end_to_end_mines_the_close_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = dir.path().join("corpus");
        write_example_corpus(&corpus);
        let cache = ResultCache::open(dir.path().join("cache")).expect("cache");
        let embedder = TableEmbedder::new();
        let controls = controls(example_filter());

        let report = run(&corpus, &cache, &controls, &embedder, None, "test_run")
            .expect("pipeline run");
        assert_eq!(report.shards_discovered, 3);
        assert_eq!(report.embeddings.computed, 3);
        assert_eq!(report.searches.computed, 3);
        assert_eq!(report.pair_files.computed, 3);

        // A and B embed within distance 0.3 of each other and differ
        // lexically, so both directions survive; C matches nothing.
        assert_eq!(report.dataset_pairs, 2);
        let body = fs::read_to_string(&report.dataset_path).expect("dataset");
        assert!(body.contains("Despite the complexity"));
        assert!(body.contains("She finished fast"));
        assert!(!body.contains("unrelated"));
    }

    #[test]
    fn rerun_is_pure_cache_hits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = dir.path().join("corpus");
        write_example_corpus(&corpus);
        let cache = ResultCache::open(dir.path().join("cache")).expect("cache");
        let embedder = TableEmbedder::new();
        let controls = controls(example_filter());

        run(&corpus, &cache, &controls, &embedder, None, "test_run").expect("first run");
        let calls_after_first = embedder.calls.load(Ordering::Relaxed);

        let report =
            run(&corpus, &cache, &controls, &embedder, None, "test_run").expect("second run");
        assert_eq!(embedder.calls.load(Ordering::Relaxed), calls_after_first);
        assert_eq!(report.embeddings.from_cache, 3);
        assert_eq!(report.embeddings.computed, 0);
        assert_eq!(report.indexes.from_cache, 1);
        assert_eq!(report.pair_files.from_cache, 3);
        assert_eq!(report.searches.computed + report.searches.from_cache, 0);
        assert_eq!(report.dataset_pairs, 2);
    }

    #[test]
    fn empty_corpus_aborts_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = dir.path().join("corpus");
        fs::create_dir_all(&corpus).expect("corpus dir");
        let cache = ResultCache::open(dir.path().join("cache")).expect("cache");
        let embedder = TableEmbedder::new();
        let controls = controls(example_filter());

        match run(&corpus, &cache, &controls, &embedder, None, "test_run") {
            Err(PipelineError::Shard(ShardError::EmptyCorpus(_))) => {}
            other => panic!("expected EmptyCorpus, got {other:?}"),
        }
    }

    #[test]
    fn failing_embedder_fails_the_run_only_when_every_shard_fails() {
        struct FailingEmbedder;
        impl SentenceEmbedder for FailingEmbedder {
            fn embed_batch(
                &self,
                _sentences: &[&str],
                _language: &str,
            ) -> Result<Vec<Vec<f32>>, EmbedderError> {
                Err(EmbedderError::Service {
                    detail: "connection refused".to_string(),
                })
            }

            fn model_version(&self) -> &str {
                "failing-1"
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = dir.path().join("corpus");
        write_example_corpus(&corpus);
        let cache = ResultCache::open(dir.path().join("cache")).expect("cache");
        let controls = controls(example_filter());

        match run(&corpus, &cache, &controls, &FailingEmbedder, None, "test_run") {
            Err(PipelineError::AllShardsFailed) => {}
            other => panic!("expected AllShardsFailed, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_pair_file_is_rebuilt_on_rerun() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = dir.path().join("corpus");
        write_example_corpus(&corpus);
        let cache = ResultCache::open(dir.path().join("cache")).expect("cache");
        let embedder = TableEmbedder::new();
        let controls = controls(example_filter());

        run(&corpus, &cache, &controls, &embedder, None, "test_run").expect("first run");

        // Mangle every pair entry; the rerun must rebuild them all.
        let pairs_dir = cache.root().join("pairs");
        for entry in fs::read_dir(&pairs_dir).expect("read pairs dir") {
            let entry = entry.expect("entry");
            fs::write(entry.path(), "corrupted not-json\n").expect("mangle");
        }

        let report =
            run(&corpus, &cache, &controls, &embedder, None, "test_run").expect("second run");
        assert_eq!(report.pair_files.computed, 3);
        assert_eq!(report.dataset_pairs, 2);
    }
}
