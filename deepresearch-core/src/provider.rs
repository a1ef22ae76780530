//! Remote deep-research provider client.
//!
//! The provider is an asynchronous job service: `submit` returns an opaque
//! session handle, `poll` reports progress until the session reaches a
//! terminal state. Sessions are held server-side; the handle alone is enough
//! to resume polling after a process restart.

use crate::config::ProviderConfig;
use crate::error::{ResearchError, Result};
use crate::types::{Source, TokenUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

/// The default provider API base URL.
const DEFAULT_BASE_URL: &str = "https://deepresearch.googleapis.com/v1";

/// Required API version header value.
const API_VERSION: &str = "2025-06-01";

/// Remote session state as reported by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Running,
    Completed,
    Failed,
    /// The provider discarded the session (TTL or eviction).
    Expired,
}

/// Outcome of a `submit` call.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Opaque handle usable for subsequent polling, even before the session
    /// is fully running.
    pub handle: String,
    pub state: PollState,
}

/// Raw result payload carried by a `Completed` poll.
#[derive(Debug, Clone, Default)]
pub struct ProviderResult {
    pub report: String,
    pub sources: Vec<Source>,
    pub metadata: Value,
}

/// One poll observation. Progress and action fields are optional: not every
/// provider response carries them, and absent values mean "unchanged".
/// `sources_so_far` lists sources the session has already gathered; it backs
/// partial preservation when a task is cancelled mid-flight.
#[derive(Debug, Clone)]
pub struct PollSnapshot {
    pub state: PollState,
    pub progress: Option<u8>,
    pub current_action: Option<String>,
    pub tokens: Option<TokenUsage>,
    pub sources_so_far: Vec<Source>,
    pub result: Option<ProviderResult>,
    pub error: Option<String>,
}

impl PollSnapshot {
    pub fn running(progress: u8, action: impl Into<String>) -> Self {
        Self {
            state: PollState::Running,
            progress: Some(progress),
            current_action: Some(action.into()),
            tokens: None,
            sources_so_far: Vec::new(),
            result: None,
            error: None,
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources_so_far = sources;
        self
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn completed(result: ProviderResult) -> Self {
        Self {
            state: PollState::Completed,
            progress: Some(100),
            current_action: Some("Research complete".into()),
            tokens: None,
            sources_so_far: Vec::new(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: PollState::Failed,
            progress: None,
            current_action: None,
            tokens: None,
            sources_so_far: Vec::new(),
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn expired() -> Self {
        Self {
            state: PollState::Expired,
            progress: None,
            current_action: None,
            tokens: None,
            sources_so_far: Vec::new(),
            result: None,
            error: None,
        }
    }
}

/// Contract the engine depends on. Implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    /// Submit a query; may take single-digit seconds.
    async fn submit(&self, query: &str, model: &str) -> Result<Submission>;

    /// Poll a session. Idempotent.
    async fn poll(&self, handle: &str) -> Result<PollSnapshot>;
}

/// Stand-in used when no credential is configured: the server still serves
/// read-only tools, and every submission fails with a diagnostic.
pub struct UnavailableProvider {
    message: String,
}

impl UnavailableProvider {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ResearchProvider for UnavailableProvider {
    async fn submit(&self, _query: &str, _model: &str) -> Result<Submission> {
        Err(ResearchError::ProviderUnavailable {
            message: self.message.clone(),
        })
    }

    async fn poll(&self, _handle: &str) -> Result<PollSnapshot> {
        Err(ResearchError::ProviderUnavailable {
            message: self.message.clone(),
        })
    }
}

/// HTTP client for the hosted deep-research API.
#[derive(Debug)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    /// Build a provider from configuration, reading the API key from the
    /// configured environment variable.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ResearchError::ProviderUnavailable {
                message: format!("environment variable '{}' is not set", config.api_key_env),
            }
        })?;
        Ok(Self::new_with_key(config, api_key))
    }

    /// Build a provider with an explicitly resolved API key.
    pub fn new_with_key(config: &ProviderConfig, api_key: String) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }

    fn parse_state(state: &str) -> PollState {
        match state {
            "completed" => PollState::Completed,
            "failed" => PollState::Failed,
            // Anything indicating a discarded session maps to Expired.
            "expired" | "not_found" | "evicted" => PollState::Expired,
            _ => PollState::Running,
        }
    }

    /// Map the wire JSON of a poll response into a snapshot.
    fn parse_snapshot(body: &Value) -> PollSnapshot {
        let state = Self::parse_state(body["state"].as_str().unwrap_or("running"));
        let progress = body["progress"]
            .as_u64()
            .map(|p| p.min(100) as u8);
        let current_action = body["current_action"].as_str().map(str::to_string);
        let tokens = body.get("usage").map(|usage| {
            TokenUsage::new(
                usage["input_tokens"].as_u64().unwrap_or(0),
                usage["output_tokens"].as_u64().unwrap_or(0),
            )
        });
        let sources_so_far = Self::parse_sources(&body["sources"]);
        let result = (state == PollState::Completed).then(|| Self::parse_result(&body["result"]));
        let error = body["error"].as_str().map(str::to_string);

        PollSnapshot {
            state,
            progress,
            current_action,
            tokens,
            sources_so_far,
            result,
            error,
        }
    }

    fn parse_sources(body: &Value) -> Vec<Source> {
        body.as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|s| Source {
                        title: s["title"].as_str().unwrap_or("Unknown").to_string(),
                        url: s["url"].as_str().unwrap_or_default().to_string(),
                        snippet: s["snippet"].as_str().unwrap_or_default().to_string(),
                        relevance_score: s["relevance_score"].as_f64().unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_result(body: &Value) -> ProviderResult {
        ProviderResult {
            report: body["report"].as_str().unwrap_or_default().to_string(),
            sources: Self::parse_sources(&body["sources"]),
            metadata: body
                .get("metadata")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
        }
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("api-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ResearchError::ProviderUnavailable {
                message: e.to_string(),
            })?;

        let status = response.status();
        let json: Value = response
            .json()
            .await
            .map_err(|e| ResearchError::ProviderUnavailable {
                message: format!("malformed provider response: {e}"),
            })?;

        if !status.is_success() {
            let message = json["error"]["message"]
                .as_str()
                .unwrap_or("provider request rejected")
                .to_string();
            return Err(ResearchError::ProviderUnavailable { message });
        }
        Ok(json)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("api-version", API_VERSION)
            .send()
            .await
            .map_err(|e| ResearchError::ProviderUnavailable {
                message: e.to_string(),
            })?;

        response
            .json()
            .await
            .map_err(|e| ResearchError::ProviderUnavailable {
                message: format!("malformed provider response: {e}"),
            })
    }
}

#[async_trait]
impl ResearchProvider for HttpProvider {
    async fn submit(&self, query: &str, model: &str) -> Result<Submission> {
        debug!(model, query_len = query.len(), "submitting research query");
        let body = serde_json::json!({
            "query": query,
            "model": model,
        });
        let json = self.post_json("/interactions", body).await?;

        let handle = json["id"]
            .as_str()
            .ok_or_else(|| ResearchError::ProviderUnavailable {
                message: "provider response missing interaction id".into(),
            })?
            .to_string();
        let state = Self::parse_state(json["state"].as_str().unwrap_or("running"));
        Ok(Submission { handle, state })
    }

    async fn poll(&self, handle: &str) -> Result<PollSnapshot> {
        let json = self.get_json(&format!("/interactions/{handle}")).await?;
        Ok(Self::parse_snapshot(&json))
    }
}
