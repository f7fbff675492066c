//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not
//!   configured. Lets non-embedding commands run against an existing store.
//! - **[`VertexProvider`]** — calls the Vertex AI text-embedding predict
//!   endpoint with the configured model and output dimensionality.
//!
//! A provider call makes exactly ONE attempt and classifies its failure as
//! [`EmbedError::Throttled`] (HTTP 429/5xx, quota exhaustion) or
//! [`EmbedError::Failed`] (anything else). Retry, backoff, and concurrency
//! policy all live in the executor, which needs the classification to drive
//! its tuning.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::errors::EmbedError;

/// Distinguishes document-side from query-side embeddings.
///
/// The two map to the provider task-type strings from the config
/// (`RETRIEVAL_DOCUMENT` / `RETRIEVAL_QUERY` by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Document,
    Query,
}

/// Trait for embedding providers.
///
/// Object-safe so the executor and search path can share one
/// `Arc<dyn EmbeddingProvider>`, and so tests can substitute a mock.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"gemini-embedding-001"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed one text. Single attempt; no internal retries.
    async fn embed(&self, text: &str, task: TaskType) -> Result<Vec<f32>, EmbedError>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str, _task: TaskType) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Failed(
            "Embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Vertex AI Provider ============

/// Embedding provider using the Vertex AI prediction API.
///
/// Calls `POST .../publishers/google/models/{model}:predict` with one
/// instance per call. Requires:
/// - `VERTEX_ACCESS_TOKEN` — OAuth bearer token
/// - `GOOGLE_CLOUD_PROJECT` — project id
///
/// The location defaults to `us-central1` and can be overridden with
/// `VERTEX_LOCATION`.
pub struct VertexProvider {
    model: String,
    dims: usize,
    task_type_document: String,
    task_type_query: String,
    endpoint: String,
    token: String,
    client: reqwest::Client,
}

impl VertexProvider {
    /// Create a new Vertex provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config, or if the
    /// required environment variables are missing.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Vertex provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Vertex provider"))?;

        let token = std::env::var("VERTEX_ACCESS_TOKEN")
            .map_err(|_| anyhow::anyhow!("VERTEX_ACCESS_TOKEN environment variable not set"))?;
        let project = std::env::var("GOOGLE_CLOUD_PROJECT")
            .map_err(|_| anyhow::anyhow!("GOOGLE_CLOUD_PROJECT environment variable not set"))?;
        let location =
            std::env::var("VERTEX_LOCATION").unwrap_or_else(|_| "us-central1".to_string());

        let endpoint = format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{proj}/locations/{loc}/publishers/google/models/{model}:predict",
            loc = location,
            proj = project,
            model = model,
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            task_type_document: config.task_type_document.clone(),
            task_type_query: config.task_type_query.clone(),
            endpoint,
            token,
            client,
        })
    }

    fn task_string(&self, task: TaskType) -> &str {
        match task {
            TaskType::Document => &self.task_type_document,
            TaskType::Query => &self.task_type_query,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for VertexProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str, task: TaskType) -> Result<Vec<f32>, EmbedError> {
        let body = serde_json::json!({
            "instances": [{
                "content": text,
                "task_type": self.task_string(task),
            }],
            "parameters": { "outputDimensionality": self.dims },
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    EmbedError::Throttled(format!("request error: {}", e))
                } else {
                    EmbedError::Failed(format!("request error: {}", e))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            // 429 and 5xx are overload signals; everything else is a
            // permanent error for this call.
            if status.as_u16() == 429
                || status.is_server_error()
                || body_text.contains("RESOURCE_EXHAUSTED")
            {
                return Err(EmbedError::Throttled(format!(
                    "Vertex API error {}: {}",
                    status, body_text
                )));
            }
            return Err(EmbedError::Failed(format!(
                "Vertex API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EmbedError::Failed(format!("invalid response body: {}", e)))?;

        parse_vertex_response(&json, self.dims)
    }
}

/// Extract the embedding values from a Vertex predict response.
fn parse_vertex_response(json: &serde_json::Value, dims: usize) -> Result<Vec<f32>, EmbedError> {
    let values = json
        .get("predictions")
        .and_then(|p| p.as_array())
        .and_then(|p| p.first())
        .and_then(|p| p.get("embeddings"))
        .and_then(|e| e.get("values"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            EmbedError::Failed("invalid Vertex response: missing embeddings.values".to_string())
        })?;

    let vector: Vec<f32> = values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect();

    if vector.len() != dims {
        return Err(EmbedError::Failed(format!(
            "Vertex returned {} dims, expected {}",
            vector.len(),
            dims
        )));
    }

    Ok(vector)
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "vertex" => Ok(Box::new(VertexProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
