//! Language-model interaction contract
//!
//! The remote language-model service is an external collaborator
//! (`spec.md` §1, §6): it accepts a prompt and returns a text body. This
//! module defines that contract as a trait plus two implementations — an
//! `reqwest`-backed HTTP client for real runs, and a scripted double for
//! tests that never touches the network.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One completion request. `timeout` is enforced by the caller via
/// `tokio::time::timeout`, not by the client itself, so the same client can
/// serve both the 20s per-thread calls and the 60s flat/final calls.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// A successful completion. `tokens_in`/`tokens_out` feed the
/// `llm_tokens_in_total`/`llm_tokens_out_total` counters and the run-level
/// token budget.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

impl LlmResponse {
    pub fn new(text: impl Into<String>, tokens_in: u32, tokens_out: u32) -> Self {
        Self {
            text: text.into(),
            tokens_in,
            tokens_out,
        }
    }
}

/// Failure modes the caller degrades on. Transport-level detail collapses
/// into these three buckets; the caller only needs to know which degrade
/// path to take (§7).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm call timed out")]
    Timeout,
    #[error("llm http error: {0}")]
    Http(u16),
    #[error("llm bad gateway")]
    BadGateway,
}

/// Language-model service contract.
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError>;
}

#[derive(Debug, Serialize)]
struct CompletionPayload<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    text: String,
    #[serde(default)]
    tokens_in: u32,
    #[serde(default)]
    tokens_out: u32,
}

/// Calls a configurable REST endpoint over HTTPS (`rustls`-tls, via
/// `reqwest`'s `rustls-tls` feature). The endpoint is expected to accept
/// `{model, prompt, max_tokens, temperature}` and return
/// `{text, tokens_in, tokens_out}`; any other shape never leaves this
/// module — it only speaks [`LlmRequest`]/[`LlmResponse`]/[`LlmError`] to
/// callers.
pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
}

impl HttpLlmClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait]
impl LanguageModelClient for HttpLlmClient {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let payload = CompletionPayload {
            model: &self.model,
            prompt: &req.prompt,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };

        let mut builder = self.http.post(&self.endpoint).timeout(req.timeout).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Http(0)
            }
        })?;

        let status = response.status();
        if status.as_u16() == 502 {
            return Err(LlmError::BadGateway);
        }
        if !status.is_success() {
            return Err(LlmError::Http(status.as_u16()));
        }

        let parsed: CompletionResponse = response.json().await.map_err(|_| LlmError::Http(status.as_u16()))?;
        Ok(LlmResponse {
            text: parsed.text,
            tokens_in: parsed.tokens_in,
            tokens_out: parsed.tokens_out,
        })
    }
}

/// Canned-response double used by tests. Responses are consumed in order;
/// once exhausted, every further call returns the last response again so a
/// test does not need to size the script exactly to the call count.
pub struct ScriptedLlmClient {
    responses: tokio::sync::Mutex<std::collections::VecDeque<Result<LlmResponse, LlmErrorKind>>>,
}

/// A `Clone`-able stand-in for [`LlmError`] (which wraps no cloneable data
/// but is trivially reconstructible) used to script [`ScriptedLlmClient`]
/// responses.
#[derive(Debug, Clone, Copy)]
pub enum LlmErrorKind {
    Timeout,
    Http(u16),
    BadGateway,
}


impl From<LlmErrorKind> for LlmError {
    fn from(kind: LlmErrorKind) -> Self {
        match kind {
            LlmErrorKind::Timeout => LlmError::Timeout,
            LlmErrorKind::Http(code) => LlmError::Http(code),
            LlmErrorKind::BadGateway => LlmError::BadGateway,
        }
    }
}

impl ScriptedLlmClient {
    /// Build a client that returns each response in order, then repeats the
    /// last one.
    pub fn new(script: Vec<Result<LlmResponse, LlmErrorKind>>) -> Self {
        Self {
            responses: tokio::sync::Mutex::new(script.into()),
        }
    }

    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(LlmResponse::new(text, 0, 0))])
    }
}

#[async_trait]
impl LanguageModelClient for ScriptedLlmClient {
    async fn complete(&self, _req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut guard = self.responses.lock().await;
        let next = if guard.len() > 1 {
            guard.pop_front()
        } else {
            guard.front().cloned()
        };
        match next {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(kind)) => Err(kind.into()),
            None => Err(LlmError::Http(0)),
        }
    }
}
