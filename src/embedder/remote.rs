//! Blocking HTTP adapter for a remote sentence-embedding server.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{EmbedderError, SentenceEmbedder};

/// Client for an embedding server exposing a single `POST /embed` endpoint.
///
/// The request body carries the model version, language code, and sentence
/// batch; the response is `{"embeddings": [[f32, ...], ...]}` with the same
/// length and order as the input. Failed calls surface as
/// [`EmbedderError::Service`] without any internal retry.
pub struct RemoteEmbedder {
    client: Client,
    endpoint: String,
    model_version: String,
}

impl RemoteEmbedder {
    /// Builds a client for the server at `base_url`.
    pub fn new(
        base_url: &str,
        model_version: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EmbedderError> {
        let model_version = model_version.into();
        if model_version.trim().is_empty() {
            return Err(EmbedderError::Service {
                detail: "missing embedding model version".to_string(),
            });
        }
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| EmbedderError::Service {
                detail: format!("failed to build HTTP client: {err}"),
            })?;
        let endpoint = format!("{}/embed", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model_version,
        })
    }
}

impl SentenceEmbedder for RemoteEmbedder {
    fn embed_batch(
        &self,
        sentences: &[&str],
        language: &str,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if sentences.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbedRequest {
            model: &self.model_version,
            language,
            sentences,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| EmbedderError::Service {
                detail: format!("embedding request failed: {err}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbedderError::Service {
                detail: format!("embedding server returned {status}: {body}"),
            });
        }

        let parsed: EmbedResponse = response.json().map_err(|err| EmbedderError::Service {
            detail: format!("failed to parse embedding response: {err}"),
        })?;
        if parsed.embeddings.len() != sentences.len() {
            return Err(EmbedderError::ShapeMismatch {
                expected: sentences.len(),
                actual: parsed.embeddings.len(),
            });
        }
        Ok(parsed.embeddings)
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    language: &'a str,
    sentences: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}
