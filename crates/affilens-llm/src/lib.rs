//! Chat-completion backends for the extraction and normalization stages.
//!
//! Backends:
//!   OpenAiBackend: the OpenAI API (gpt-4o-mini by default)
//!   OpenAiCompatibleBackend: any OpenAI-compatible endpoint (vLLM, Ollama,
//!   LMStudio, OpenRouter, ...)
//!
//! All pipeline call sites go through [`LlmClient`], which enforces a shared
//! concurrency budget so extraction and normalization fallback draw from the
//! same pool of in-flight requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

pub mod mock;

/// Upper bound on one chat completion round trip. Slow providers get ample
/// room, but a wedged connection can never hang a pipeline worker.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("API error [{status}]: {message}")]
    Api { status: u16, message: String },
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "system" | "user" | "assistant"
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmRequest {
    /// A deterministic (temperature 0) request, the default for structured output.
    pub fn structured(messages: Vec<Message>) -> Self {
        Self {
            messages,
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError>;
    fn model_id(&self) -> &str;
}

// ── OpenAI-style response handling ──────────────────────────────────────

fn parse_openai_response(json: &serde_json::Value, fallback_model: &str) -> LlmResponse {
    LlmResponse {
        content: json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        model: json["model"].as_str().unwrap_or(fallback_model).to_string(),
        prompt_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

async fn check_response_status(resp: reqwest::Response) -> Result<serde_json::Value, LlmError> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        tracing::warn!(?retry_after, "llm rate limited (429)");
        return Err(LlmError::RateLimited { retry_after });
    }
    let body: serde_json::Value = resp.json().await?;
    if status >= 400 {
        let message = body["error"]["message"]
            .as_str()
            .or_else(|| body["message"].as_str())
            .unwrap_or("unknown API error")
            .to_string();
        return Err(LlmError::Api { status, message });
    }
    Ok(body)
}

// ── OpenAI ──────────────────────────────────────────────────────────────

pub struct OpenAiBackend {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = serde_json::json!({
            "model": &self.model,
            "messages": req.messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = check_response_status(resp).await?;
        Ok(parse_openai_response(&json, &self.model))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ── OpenAI-compatible (vLLM, Ollama, LMStudio, OpenRouter, …) ───────────

pub struct OpenAiCompatibleBackend {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: http_client(),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": &self.model,
            "messages": req.messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;
        let json = check_response_status(resp).await?;
        Ok(parse_openai_response(&json, &self.model))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ── Shared-budget client ────────────────────────────────────────────────

/// Wraps a backend with a semaphore so all pipeline call sites (extraction
/// and normalization fallback) share one in-flight request budget.
pub struct LlmClient {
    backend: Arc<dyn LlmBackend>,
    permits: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(backend: Arc<dyn LlmBackend>, max_in_flight: usize) -> Self {
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    /// Complete a request under the shared budget.
    pub async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        // Semaphore is never closed, so acquire cannot fail.
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        tracing::debug!(model = self.backend.model_id(), "chat completion request");
        self.backend.complete(req).await
    }

    /// Complete a request and parse the reply as a single JSON value.
    ///
    /// Accepts a bare JSON object/array or one wrapped in a ``` fence.
    pub async fn complete_json(&self, req: LlmRequest) -> Result<serde_json::Value, LlmError> {
        let resp = self.complete(req).await?;
        parse_json_payload(&resp.content)
            .ok_or_else(|| LlmError::InvalidResponse(truncate_for_log(&resp.content)))
    }
}

/// Extract a JSON value from model output.
///
/// Models frequently wrap structured output in a Markdown fence or lead with
/// prose; tolerate both by scanning for the first `{` or `[` and parsing from
/// there.
pub fn parse_json_payload(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    // Fenced block: ```json ... ``` or ``` ... ```
    let candidate = if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        match after.find("```") {
            Some(end) => after[..end].trim(),
            None => after.trim(),
        }
    } else {
        trimmed
    };

    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }

    // Fall back to the first brace-delimited span.
    let start = candidate.find(['{', '['])?;
    let tail = &candidate[start..];
    let mut deserializer = serde_json::Deserializer::from_str(tail).into_iter::<serde_json::Value>();
    deserializer.next().and_then(|r| r.ok())
}

fn truncate_for_log(content: &str) -> String {
    const MAX: usize = 200;
    if content.len() <= MAX {
        content.to_string()
    } else {
        let mut end = MAX;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &content[..end])
    }
}
