//! Embedding service abstraction
//!
//! Providers:
//! - Ollama (`/api/embeddings`, e.g. nomic-embed-text)
//! - Mock (random vectors, for tests and dry runs)

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, in order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Check that the provider is reachable
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Ollama embedding client
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    max_retries: u32,
    initial_backoff: Duration,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl OllamaEmbedder {
    /// Create a new Ollama embedder
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(200),
        })
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(Duration::from_secs(5))
            .with_max_elapsed_time(Some(Duration::from_secs(60)))
            .build()
    }

    async fn make_request(&self, text: &str) -> std::result::Result<Vec<f32>, backoff::Error<AppError>> {
        let url = format!("{}/api/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&OllamaRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| {
                backoff::Error::transient(AppError::EmbeddingError {
                    message: format!("Request failed: {}", e),
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = AppError::EmbeddingError {
                message: format!("Ollama embeddings failed: HTTP {} {}", status.as_u16(), body.trim()),
            };
            // 4xx means the request itself is wrong (unknown model, bad payload)
            return Err(if status.is_client_error() {
                backoff::Error::permanent(err)
            } else {
                backoff::Error::transient(err)
            });
        }

        let result: OllamaResponse = response.json().await.map_err(|e| {
            backoff::Error::permanent(AppError::EmbeddingError {
                message: format!("Failed to parse response: {}", e),
            })
        })?;

        match result.embedding {
            Some(embedding) if !embedding.is_empty() => Ok(embedding),
            _ => Err(backoff::Error::permanent(AppError::EmbeddingError {
                message: "No embedding returned from Ollama".to_string(),
            })),
        }
    }

    /// Make request with retry
    async fn request_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        let attempts = AtomicU32::new(0);

        retry(self.backoff_policy(), || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.make_request(text).await.map_err(|err| match err {
                backoff::Error::Transient { err, .. } if attempt <= self.max_retries => {
                    tracing::warn!(
                        attempt = attempt,
                        max_retries = self.max_retries,
                        error = %err,
                        "Embedding request failed, retrying"
                    );
                    backoff::Error::transient(err)
                }
                backoff::Error::Transient { err, .. } => backoff::Error::permanent(err),
                permanent => permanent,
            })
        })
        .await
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let start = Instant::now();
        let result = self.request_with_retry(text).await;
        metrics::record_embedding(start.elapsed().as_secs_f64(), &self.model, result.is_ok());

        let embedding = result?;
        if embedding.len() != self.dimension {
            tracing::warn!(
                expected = self.dimension,
                actual = embedding.len(),
                model = %self.model,
                "Embedding dimension differs from configuration"
            );
        }
        Ok(embedding)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| AppError::EmbeddingError {
            message: format!("Ollama not reachable at {}: {}", self.base_url, e),
        })?;

        if !response.status().is_success() {
            return Err(AppError::EmbeddingError {
                message: format!("Ollama /api/tags returned HTTP {}", response.status().as_u16()),
            });
        }

        Ok(())
    }
}

/// Mock embedder for testing
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Ok((0..self.dimension).map(|_| rng.gen::<f32>()).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => Err(AppError::Configuration {
            message: format!("Unknown embedding provider: {}", other),
        }),
    }
}
