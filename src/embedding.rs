//! Embedding client contract and HTTP adapter
//!
//! The engine only consumes the contract: `embed(texts)` returns one
//! unit-length row per input text, so a dot product between two rows is their
//! cosine similarity. Empty input yields a `(0, 0)` matrix.
//!
//! [`HttpEmbedder`] talks to any OpenAI-compatible `/v1/embeddings` endpoint
//! (text-embeddings-inference, Ollama, vLLM) and re-normalizes every row, so
//! the unit-length guarantee holds regardless of the server's settings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::EmbeddingError;

/// Trait for text embedding services
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingMatrix, EmbeddingError>;

    /// Model identifier echoed into provenance.
    fn model_name(&self) -> &str;
}

/// Shared embedder injected into the engine
pub type SharedEmbedder = Arc<dyn Embedder>;

// ---------------------------------------------------------------------------
// EmbeddingMatrix
// ---------------------------------------------------------------------------

/// Row-major matrix of unit-length `f32` vectors sharing one dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingMatrix {
    rows: Vec<Vec<f32>>,
}

impl EmbeddingMatrix {
    /// The `(0, 0)` result of embedding nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from rows that are already unit length. All rows must share one
    /// dimension.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, EmbeddingError> {
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        for (row, v) in rows.iter().enumerate() {
            if v.len() != dim {
                return Err(EmbeddingError::DimensionMismatch {
                    row,
                    expected: dim,
                    got: v.len(),
                });
            }
        }
        Ok(Self { rows })
    }

    /// Build from raw rows, L2-normalizing each one.
    pub fn normalized(rows: Vec<Vec<f32>>) -> Result<Self, EmbeddingError> {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(row, v)| l2_normalize(v).ok_or(EmbeddingError::ZeroVector { row }))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_rows(rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Vec<f32>> {
        self.rows
    }
}

/// Dot product accumulated in `f64`. Equals cosine similarity for unit rows.
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

/// Scale a vector to unit length. `None` for the zero vector.
pub fn l2_normalize(mut v: Vec<f32>) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return None;
    }
    for x in &mut v {
        *x = (f64::from(*x) / norm) as f32;
    }
    Some(v)
}

// ---------------------------------------------------------------------------
// HttpEmbedder
// ---------------------------------------------------------------------------

/// Maximum texts per HTTP request.
const DEFAULT_MAX_BATCH: usize = 128;

/// Request timeout for one embedding call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for [`HttpEmbedder`]
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Full endpoint URL, e.g. `http://embeddings:8080/v1/embeddings`.
    pub endpoint: Url,
    /// Model identifier sent with each request and recorded in provenance.
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_batch: usize,
}

impl EmbeddingConfig {
    pub fn new(endpoint: Url, model: impl Into<String>) -> Self {
        Self {
            endpoint,
            model: model.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

/// OpenAI-compatible embeddings client
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut request = self
            .client
            .post(self.config.endpoint.clone())
            .json(&EmbeddingRequest {
                model: &self.config.model,
                input: texts,
            });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await?
            .error_for_status()?
            .json::<EmbeddingResponse>()
            .await?;

        if response.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: response.data.len(),
            });
        }

        // Sort by index to maintain order
        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingMatrix, EmbeddingError> {
        if texts.is_empty() {
            return Ok(EmbeddingMatrix::empty());
        }

        let trimmed: Vec<String> = texts.iter().map(|t| t.trim().to_string()).collect();
        let mut rows = Vec::with_capacity(trimmed.len());
        for chunk in trimmed.chunks(self.config.max_batch.max(1)) {
            rows.extend(self.embed_chunk(chunk).await?);
        }

        debug!(
            count = rows.len(),
            model = %self.config.model,
            "Embedded batch"
        );
        EmbeddingMatrix::normalized(rows)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
