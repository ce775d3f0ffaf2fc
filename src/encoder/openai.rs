//! Encoder backed by an OpenAI-compatible `/embeddings` endpoint.
//!
//! Self-hosted sentence-transformers servers expose the same API, which is how the
//! canonical model is usually served.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::SentenceEncoder;
use crate::config::ModelSpec;

/// Blocking client for OpenAI-compatible embedding endpoints.
#[derive(Clone)]
pub struct OpenAiEncoder {
    client: Client,
    endpoint: String,
    model: ModelSpec,
    max_retries: usize,
    batch_size: usize,
}

impl OpenAiEncoder {
    /// Builds a new client. `api_key` may be empty for unauthenticated local servers.
    pub fn new(
        api_key: Option<String>,
        base_url: String,
        model: ModelSpec,
        timeout: Duration,
        max_retries: usize,
        batch_size: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!base_url.trim().is_empty(), "missing encoder base URL");
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let auth = format!("Bearer {key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid encoder API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build encoder HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            max_retries: max_retries.max(1),
            batch_size: batch_size.max(1),
        })
    }

    fn encode_chunk(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0usize;
        loop {
            let request = EmbeddingRequest {
                model: self.model.name(),
                input: inputs,
            };
            match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse = resp
                            .json()
                            .context("failed to parse embedding response")?;
                        parsed.data.sort_by_key(|entry| entry.index);
                        anyhow::ensure!(
                            parsed.data.len() == inputs.len(),
                            "encoder returned {} embeddings for {} inputs",
                            parsed.data.len(),
                            inputs.len()
                        );
                        let vectors: Vec<Vec<f32>> =
                            parsed.data.into_iter().map(|entry| entry.embedding).collect();
                        if let Some(bad) = vectors
                            .iter()
                            .find(|v| v.len() != self.model.dimensions())
                        {
                            anyhow::bail!(
                                "model {} returned a {}-dimensional vector, expected {}",
                                self.model.name(),
                                bad.len(),
                                self.model.dimensions()
                            );
                        }
                        return Ok(vectors);
                    }

                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(%status, attempt, "retrying embedding request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    anyhow::bail!("embedding request failed ({status}): {body}");
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(error = %err, attempt, "retrying embedding request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(err).context("embedding request failed");
                }
            }
        }
    }
}

impl SentenceEncoder for OpenAiEncoder {
    fn model_name(&self) -> &str {
        self.model.name()
    }

    fn dimensions(&self) -> usize {
        self.model.dimensions()
    }

    fn encode(&self, sentences: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(sentences.len());
        for chunk in sentences.chunks(self.batch_size) {
            debug!(sentences = chunk.len(), "encoding chunk");
            out.extend(self.encode_chunk(chunk)?);
        }
        Ok(out)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(250 * (1 << capped))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(borrow)]
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
