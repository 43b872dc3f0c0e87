// 🌐 Model Clients - Blocking clients for OpenAI-compatible chat + embeddings
// One HTTP attempt per call; retry and backoff belong to the runner and indexer.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{UpstreamError, UpstreamKind};
use crate::index::EmbeddingProvider;
use crate::normalizer::LanguageModel;

/// Chat-completions client (Groq, OpenAI and compatible gateways).
pub struct ChatClient {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl ChatClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: String,
        timeout: Duration,
        temperature: f32,
        max_tokens: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!model.trim().is_empty(), "missing chat model name");
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(auth_headers(api_key)?)
            .build()
            .context("failed to build chat HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model,
            temperature,
            max_tokens,
        })
    }
}

impl LanguageModel for ChatClient {
    fn complete(&self, prompt: &str) -> Result<String, UpstreamError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, resp));
        }

        let parsed: ChatResponse = resp.json().map_err(transport_error)?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| UpstreamError::new(UpstreamKind::Transient, "response had no choices"))?;

        // Reasoning models sometimes leave `content` empty and answer in `reasoning`
        let text = match message.content {
            Some(content) if !content.trim().is_empty() => content,
            _ => message.reasoning.unwrap_or_default(),
        };
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Embeddings client for `/embeddings`.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: String,
        dimensions: Option<usize>,
        timeout: Duration,
        batch_size: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!model.trim().is_empty(), "missing embedding model name");
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(auth_headers(api_key)?)
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model,
            dimensions,
            batch_size: batch_size.max(1),
        })
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, resp));
        }

        let mut parsed: EmbeddingResponse = resp.json().map_err(transport_error)?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(UpstreamError::new(
                UpstreamKind::Transient,
                format!(
                    "embedding API returned {} vectors for {} inputs",
                    parsed.data.len(),
                    inputs.len()
                ),
            ));
        }

        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

fn auth_headers(api_key: &str) -> Result<HeaderMap> {
    anyhow::ensure!(!api_key.trim().is_empty(), "missing API key");
    let mut headers = HeaderMap::new();
    let auth = format!("Bearer {}", api_key.trim());
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&auth).context("invalid API key")?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// 429 → rate limited, 408/5xx → transient, anything else is a rejection
pub fn classify_status(status: StatusCode) -> UpstreamKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        UpstreamKind::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        UpstreamKind::Transient
    } else {
        UpstreamKind::Rejected
    }
}

fn status_error(status: StatusCode, resp: reqwest::blocking::Response) -> UpstreamError {
    let body = resp
        .text()
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    UpstreamError::new(classify_status(status), format!("{}: {}", status, body))
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    let kind = if err.is_timeout()
        || err.is_connect()
        || err.is_body()
        || err.is_request()
        || err.is_decode()
    {
        UpstreamKind::Transient
    } else {
        UpstreamKind::Rejected
    };
    UpstreamError::new(kind, err.to_string())
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
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
