//! Reasoning backend client
//!
//! A black-box text completion service: prompt in, completion out, under a
//! timeout. The engine only ever sees `ReasoningBackend`.

use crate::config::BackendConfig;
use crate::decision::{CandidateAction, CandidateSource};
use crate::retry::Retryable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("cannot reach backend: {0}")]
    Connect(String),
    #[error("backend server error ({status})")]
    Server { status: u16 },
    #[error("backend rate limited the request")]
    RateLimited,
    #[error("backend rejected the request ({status}): {body}")]
    Malformed { status: u16, body: String },
    #[error("backend authentication failed ({status})")]
    Auth { status: u16 },
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_)
                | BackendError::Connect(_)
                | BackendError::Server { .. }
                | BackendError::RateLimited
        )
    }
}

impl BackendError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => BackendError::Auth { status },
            429 => BackendError::RateLimited,
            500..=599 => BackendError::Server { status },
            _ => BackendError::Malformed { status, body },
        }
    }
}

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: Option<String>,
}

/// HTTP completion endpoint (llamafile / llama.cpp server shape)
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    temperature: f32,
    max_tokens: u32,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl ReasoningBackend for HttpBackend {
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError> {
        let request = CompletionRequest {
            prompt,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(timeout)
                } else {
                    BackendError::Connect(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let body: CompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(timeout)
            } else {
                BackendError::InvalidResponse(e.to_string())
            }
        })?;
        let content = body
            .content
            .ok_or_else(|| BackendError::InvalidResponse("missing \"content\" field".into()))?;
        debug!(chars = content.len(), "backend completion received");
        Ok(content.trim().to_string())
    }
}

#[derive(Deserialize)]
struct RawCandidate {
    command: Option<String>,
    #[serde(default)]
    rationale: String,
    risk_score: Option<f64>,
}

/// Parse a completion into a candidate.
///
/// The completion must contain one JSON object with `command`, `rationale`
/// and `risk_score`. A null or empty command means the backend proposes
/// nothing (`Ok(None)`). A missing risk score counts as maximal risk.
pub fn parse_candidate(completion: &str) -> Result<Option<CandidateAction>, BackendError> {
    let start = completion.find('{');
    let end = completion.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &completion[s..=e],
        _ => {
            return Err(BackendError::InvalidResponse(
                "completion contains no JSON object".into(),
            ))
        }
    };

    let raw: RawCandidate =
        serde_json::from_str(json).map_err(|e| BackendError::InvalidResponse(format!("unparseable candidate: {e}")))?;

    let command = match raw.command.map(|c| c.trim().to_string()) {
        Some(c) if !c.is_empty() => c,
        _ => return Ok(None),
    };

    Ok(Some(CandidateAction {
        source: CandidateSource::ReasoningBackend,
        command,
        rationale: raw.rationale,
        risk_score: raw.risk_score.unwrap_or(1.0),
    }))
}
