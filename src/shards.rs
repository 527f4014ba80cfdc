//! Corpus shard discovery, sentence tokenization, and shard fingerprints.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fingerprint::{Fingerprint, FingerprintBuilder};

/// Stable shard identifier derived from the corpus file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Builds an id from a raw string (used by tests and cache readers).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable record describing one corpus text shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextShard {
    /// Stable shard identity within the corpus.
    pub id: ShardId,
    /// File the shard was read from.
    pub source_path: PathBuf,
    /// Content digest over the shard's sentence sequence, order-sensitive.
    pub fingerprint: Fingerprint,
    /// Number of sentences produced by tokenization.
    pub sentence_count: usize,
}

/// Errors raised while discovering or reading corpus shards.
#[derive(Debug)]
pub enum ShardError {
    /// The corpus root contained zero eligible shards.
    EmptyCorpus(PathBuf),
    /// A shard input lacked the structure the pipeline requires.
    Schema {
        /// Offending file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },
    /// Filesystem failure while reading the corpus.
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardError::EmptyCorpus(root) => {
                write!(f, "no eligible text shards under {}", root.display())
            }
            ShardError::Schema { path, detail } => {
                write!(f, "shard {} failed schema check: {detail}", path.display())
            }
            ShardError::Io { path, source } => {
                write!(f, "io error on {}: {source}", path.display())
            }
        }
    }
}

impl Error for ShardError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShardError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Outcome of a corpus scan: usable shards plus per-file failures.
///
/// A shard that fails its schema check never aborts the scan; it is recorded
/// here so the run report can count it.
#[derive(Debug)]
pub struct ShardScan {
    /// Shards eligible for mining, in lexicographic path order.
    pub shards: Vec<TextShard>,
    /// Per-file failures that did not abort the scan.
    pub skipped: Vec<ShardError>,
}

/// Discovers the text shards under `corpus_root`.
///
/// Eligible shards are `.txt` files directly under the root that tokenize to
/// at least one sentence. Discovery order (and therefore shard processing
/// order) is lexicographic by file name, so shard ids are stable across runs
/// regardless of directory enumeration order.
pub fn list_shards(corpus_root: &Path) -> Result<ShardScan, ShardError> {
    let entries = fs::read_dir(corpus_root).map_err(|source| ShardError::Io {
        path: corpus_root.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ShardError::Io {
            path: corpus_root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "txt") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut shards = Vec::with_capacity(paths.len());
    let mut skipped = Vec::new();
    for path in paths {
        match scan_shard(&path) {
            Ok(Some(shard)) => shards.push(shard),
            Ok(None) => skipped.push(ShardError::Schema {
                path,
                detail: "no sentences after tokenization".to_string(),
            }),
            Err(err) => skipped.push(err),
        }
    }

    if shards.is_empty() {
        return Err(ShardError::EmptyCorpus(corpus_root.to_path_buf()));
    }
    Ok(ShardScan { shards, skipped })
}

fn scan_shard(path: &Path) -> Result<Option<TextShard>, ShardError> {
    let raw = read_shard_text(path)?;
    let sentences = tokenize_sentences(&raw);
    if sentences.is_empty() {
        return Ok(None);
    }
    let id = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| ShardId::new(stem.to_string()))
        .ok_or_else(|| ShardError::Schema {
            path: path.to_path_buf(),
            detail: "file stem is not valid UTF-8".to_string(),
        })?;
    Ok(Some(TextShard {
        id,
        source_path: path.to_path_buf(),
        fingerprint: fingerprint_sentences(&sentences),
        sentence_count: sentences.len(),
    }))
}

fn read_shard_text(path: &Path) -> Result<String, ShardError> {
    let bytes = fs::read(path).map_err(|source| ShardError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    String::from_utf8(bytes).map_err(|_| ShardError::Schema {
        path: path.to_path_buf(),
        detail: "file is not valid UTF-8 text".to_string(),
    })
}

/// Splits raw shard text into sentences.
///
/// Lines are the primary unit (corpus files carry one sentence per line);
/// lines holding several sentences are split after terminal punctuation that
/// is followed by whitespace. Empty and whitespace-only results are dropped.
pub fn tokenize_sentences(raw: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let chars: Vec<(usize, char)> = line.char_indices().collect();
        let mut segment_start = 0usize;
        for (pos, &(offset, ch)) in chars.iter().enumerate() {
            if !matches!(ch, '.' | '!' | '?') {
                continue;
            }
            let followed_by_space = chars
                .get(pos + 1)
                .is_none_or(|&(_, next)| next.is_whitespace());
            if !followed_by_space {
                continue;
            }
            let end = offset + ch.len_utf8();
            let piece = line[segment_start..end].trim();
            if !piece.is_empty() {
                sentences.push(piece.to_string());
            }
            segment_start = end;
        }
        let tail = line[segment_start..].trim();
        if !tail.is_empty() {
            sentences.push(tail.to_string());
        }
    }
    sentences
}

/// Order-sensitive digest over a sentence sequence.
pub fn fingerprint_sentences(sentences: &[String]) -> Fingerprint {
    let mut builder = FingerprintBuilder::new("shard");
    for sentence in sentences {
        builder.push_str(sentence);
    }
    builder.finish()
}

/// Re-reads and re-tokenizes a shard's sentences.
///
/// The content is verified against the shard's recorded fingerprint; a
/// mismatch means the file changed after discovery and is surfaced as a
/// schema failure rather than silently desynchronizing sentence indices.
pub fn load_sentences(shard: &TextShard) -> Result<Vec<String>, ShardError> {
    let raw = read_shard_text(&shard.source_path)?;
    let sentences = tokenize_sentences(&raw);
    if fingerprint_sentences(&sentences) != shard.fingerprint {
        return Err(ShardError::Schema {
            path: shard.source_path.clone(),
            detail: "content fingerprint changed since discovery".to_string(),
        });
    }
    Ok(sentences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_corpus(dir: &Path, files: &[(&str, &str)]) {
        for (name, body) in files {
            fs::write(dir.join(name), body).expect("write corpus file");
        }
    }

    #[test]
    fn tokenizer_splits_lines_and_terminal_punctuation() {
        let raw = "First sentence. Second sentence!\n\n   \nThird line without terminator\n";
        let sentences = tokenize_sentences(raw);
        assert_eq!(
            sentences,
            vec![
                "First sentence.",
                "Second sentence!",
                "Third line without terminator"
            ]
        );
    }

    #[test]
    fn tokenizer_keeps_inline_periods_intact() {
        let sentences = tokenize_sentences("Version 1.2 shipped today.");
        assert_eq!(sentences, vec!["Version 1.2 shipped today."]);
    }

    #[test]
    fn identical_content_same_fingerprint_regardless_of_file_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(
            dir.path(),
            &[("a.txt", "One sentence.\nTwo sentence.\n"), ("b.txt", "One sentence.\nTwo sentence.\n")],
        );
        let scan = list_shards(dir.path()).expect("scan");
        assert_eq!(scan.shards.len(), 2);
        assert_eq!(scan.shards[0].fingerprint, scan.shards[1].fingerprint);
        assert_ne!(scan.shards[0].id, scan.shards[1].id);
    }

    #[test]
    fn single_sentence_change_flips_fingerprint() {
        let a = fingerprint_sentences(&["same".to_string(), "one".to_string()]);
        let b = fingerprint_sentences(&["same".to_string(), "two".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_corpus_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        match list_shards(dir.path()) {
            Err(ShardError::EmptyCorpus(root)) => assert_eq!(root, dir.path()),
            other => panic!("expected EmptyCorpus, got {other:?}"),
        }
    }

    #[test]
    fn non_utf8_shard_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("bad.txt"), [0xff_u8, 0xfe, 0x00]).expect("write");
        write_corpus(dir.path(), &[("good.txt", "A fine sentence.\n")]);
        let scan = list_shards(dir.path()).expect("scan");
        assert_eq!(scan.shards.len(), 1);
        assert_eq!(scan.shards[0].id.as_str(), "good");
        assert_eq!(scan.skipped.len(), 1);
        assert!(matches!(scan.skipped[0], ShardError::Schema { .. }));
    }

    #[test]
    fn load_sentences_detects_drift() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_corpus(dir.path(), &[("s.txt", "Original sentence.\n")]);
        let scan = list_shards(dir.path()).expect("scan");
        let shard = &scan.shards[0];
        assert_eq!(load_sentences(shard).expect("load"), vec!["Original sentence."]);

        fs::write(&shard.source_path, "Mutated sentence.\n").expect("rewrite");
        assert!(matches!(
            load_sentences(shard),
            Err(ShardError::Schema { .. })
        ));
    }
}
