//! Candidate pair aggregation into a deduplicated dataset.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::filtering::{normalize_text, CandidatePair};

/// Deduplicated, stably-ordered set of candidate pairs.
///
/// Order is the first occurrence of each normalized pair key in input order;
/// aggregating identical inputs always yields an identical dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pairs: Vec<CandidatePair>,
}

impl Dataset {
    /// The deduplicated pairs.
    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    /// Number of retained pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the dataset holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Consumes the dataset, yielding its pairs.
    pub fn into_pairs(self) -> Vec<CandidatePair> {
        self.pairs
    }
}

/// Merges per-unit candidate pair outputs into one deduplicated dataset.
///
/// The dedup key is the normalized `(source, target)` text pair. On a
/// collision the pair with the higher combined score wins; an equal score
/// keeps the earlier pair, so shard processing order breaks remaining ties
/// deterministically.
pub fn aggregate<I>(sources: I) -> Dataset
where
    I: IntoIterator<Item = Vec<CandidatePair>>,
{
    let mut slots: HashMap<(String, String), usize> = HashMap::new();
    let mut pairs: Vec<CandidatePair> = Vec::new();
    for source in sources {
        for pair in source {
            let key = (normalize_text(&pair.source), normalize_text(&pair.target));
            match slots.get(&key) {
                Some(&slot) => {
                    if pair.combined_score > pairs[slot].combined_score {
                        pairs[slot] = pair;
                    }
                }
                None => {
                    slots.insert(key, pairs.len());
                    pairs.push(pair);
                }
            }
        }
    }
    Dataset { pairs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pair(source: &str, target: &str, combined_score: f64) -> CandidatePair {
        CandidatePair {
            source: source.to_string(),
            target: target.to_string(),
            scores: BTreeMap::new(),
            combined_score,
        }
    }

    #[test]
    fn duplicates_keep_the_higher_score() {
        let dataset = aggregate(vec![
            vec![pair("A sentence.", "Its paraphrase.", 0.4)],
            vec![pair("a  sentence.", "its PARAPHRASE.", 0.9)],
        ]);
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.pairs()[0].combined_score, 0.9);
    }

    #[test]
    fn equal_scores_keep_the_earliest_pair() {
        let dataset = aggregate(vec![
            vec![pair("Src.", "Tgt.", 0.5)],
            vec![pair("src.", "tgt.", 0.5)],
        ]);
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.pairs()[0].source, "Src.");
    }

    #[test]
    fn direction_matters_in_the_dedup_key() {
        let dataset = aggregate(vec![vec![
            pair("alpha", "beta", 0.1),
            pair("beta", "alpha", 0.2),
        ]]);
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let first = aggregate(vec![
            vec![
                pair("One thing.", "Another thing.", 0.7),
                pair("One thing.", "Another thing.", 0.3),
            ],
            vec![pair("Second source.", "Second target.", 0.5)],
        ]);
        let again = aggregate(vec![first.pairs().to_vec()]);
        assert_eq!(again.pairs(), first.pairs());
    }

    #[test]
    fn order_is_first_occurrence() {
        let dataset = aggregate(vec![
            vec![pair("first", "pair", 0.1)],
            vec![pair("second", "pair", 0.9), pair("first", "pair", 0.8)],
        ]);
        assert_eq!(dataset.pairs()[0].source, "first");
        assert_eq!(dataset.pairs()[0].combined_score, 0.8);
        assert_eq!(dataset.pairs()[1].source, "second");
    }
}
