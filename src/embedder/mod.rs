//! The embedding capability injected into the mining pipeline.

pub mod remote;

use std::error::Error;
use std::fmt;

pub use remote::RemoteEmbedder;

/// Something that embeds batches of sentences for a given language.
///
/// Implementations are opaque to the pipeline: vectors come back in input
/// order, one per sentence, all with the same dimension. The model version
/// participates in embedding cache keys, so it must change whenever the
/// produced vectors would.
pub trait SentenceEmbedder: Send + Sync {
    /// Embeds one batch, returning one vector per input sentence in order.
    fn embed_batch(
        &self,
        sentences: &[&str],
        language: &str,
    ) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Identifier of the underlying model.
    fn model_version(&self) -> &str;
}

/// Errors surfaced by embedding backends.
///
/// Service failures are propagated to the caller without any in-core retry;
/// retry and backoff policy belongs to whatever schedules pipeline units.
#[derive(Debug)]
pub enum EmbedderError {
    /// The external embedding service call failed.
    Service {
        /// Human-readable failure description.
        detail: String,
    },
    /// The backend returned a different number of vectors than requested.
    ShapeMismatch {
        /// Sentences submitted.
        expected: usize,
        /// Vectors returned.
        actual: usize,
    },
}

impl fmt::Display for EmbedderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedderError::Service { detail } => {
                write!(f, "embedding service failure: {detail}")
            }
            EmbedderError::ShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "embedding service returned {actual} vectors for {expected} sentences"
                )
            }
        }
    }
}

impl Error for EmbedderError {}
