use crate::error::{LlmError, Result};
use crate::openai::{ChatRequest, ChatResponse};
use crate::types::{ChatMessage, Completion};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DIAGNOSTICS_CAPACITY: usize = 64;

/// One completion attempt, as seen by the oracle loop.
#[async_trait]
pub trait Complete: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion>;
}

/// Sent as `<name>: <scheme> <key>`, or `<name>: <key>` with an empty scheme.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: String,
    pub scheme: String,
    pub key: String,
}

impl AuthHeader {
    pub fn bearer(key: impl Into<String>) -> Self {
        Self {
            name: "Authorization".to_string(),
            scheme: "Bearer".to_string(),
            key: key.into(),
        }
    }

    fn value(&self) -> String {
        if self.scheme.trim().is_empty() {
            self.key.clone()
        } else {
            format!("{} {}", self.scheme.trim(), self.key)
        }
    }
}

impl std::fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHeader")
            .field("name", &self.name)
            .field("scheme", &self.scheme)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub model: String,
    pub auth: Option<AuthHeader>,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallDiagnostics {
    pub at: DateTime<Utc>,
    pub latency_ms: u64,
    pub status: Option<u16>,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct CompletionClient {
    cfg: CompletionConfig,
    http: reqwest::Client,
    diagnostics: Arc<Mutex<VecDeque<CallDiagnostics>>>,
}

impl CompletionClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(cfg: CompletionConfig) -> Result<Self> {
        if cfg.endpoint.trim().is_empty() {
            return Err(LlmError::InvalidInput("endpoint must not be empty".to_string()));
        }
        if cfg.model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model must not be empty".to_string()));
        }
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            cfg,
            http,
            diagnostics: Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTICS_CAPACITY))),
        })
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    pub fn endpoint(&self) -> &str {
        &self.cfg.endpoint
    }

    /// Most recent calls, oldest first.
    pub fn recent_diagnostics(&self) -> Vec<CallDiagnostics> {
        let guard = self
            .diagnostics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.iter().cloned().collect()
    }

    fn record(&self, diag: CallDiagnostics) {
        if diag.ok {
            tracing::info!(
                latency_ms = diag.latency_ms,
                status = ?diag.status,
                request_bytes = diag.request_bytes,
                response_bytes = diag.response_bytes,
                "completion call finished"
            );
        } else {
            tracing::warn!(
                latency_ms = diag.latency_ms,
                status = ?diag.status,
                request_bytes = diag.request_bytes,
                error = diag.error.as_deref().unwrap_or(""),
                "completion call failed"
            );
        }
        let mut guard = self
            .diagnostics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.len() == DIAGNOSTICS_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(diag);
    }

    /// Size of the serialized request for `messages`, as it would be sent.
    pub fn request_bytes(&self, messages: &[ChatMessage]) -> Result<usize> {
        let req = ChatRequest::new(
            &self.cfg.model,
            messages,
            self.cfg.max_tokens,
            self.cfg.temperature,
        );
        Ok(serde_json::to_vec(&req)?.len())
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.cfg.model))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let req = ChatRequest::new(
            &self.cfg.model,
            messages,
            self.cfg.max_tokens,
            self.cfg.temperature,
        );
        let body = serde_json::to_vec(&req)?;
        let request_bytes = body.len();
        let started = Instant::now();

        let mut builder = self
            .http
            .post(&self.cfg.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(auth) = self.cfg.auth.as_ref() {
            builder = builder.header(auth.name.as_str(), auth.value());
        }

        let mut diag = CallDiagnostics {
            at: Utc::now(),
            latency_ms: 0,
            status: None,
            request_bytes,
            response_bytes: 0,
            ok: false,
            error: None,
        };

        let outcome = Self::send(builder, &mut diag).await;

        diag.latency_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => diag.ok = true,
            Err(e) => diag.error = Some(e.to_string()),
        }
        self.record(diag);
        outcome
    }

    async fn send(
        builder: reqwest::RequestBuilder,
        diag: &mut CallDiagnostics,
    ) -> Result<Completion> {
        let response = builder.send().await?;
        let status = response.status();
        diag.status = Some(status.as_u16());
        let text = response.text().await?;
        diag.response_bytes = text.len();
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: truncate_body(&text),
            });
        }
        let parsed: ChatResponse = serde_json::from_str(&text)?;
        Completion::try_from(parsed)
    }
}

#[async_trait]
impl Complete for CompletionClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion> {
        self.chat(messages).await
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(endpoint: String, auth: Option<AuthHeader>) -> CompletionConfig {
        CompletionConfig {
            endpoint,
            model: "test-model".to_string(),
            auth,
            timeout: Duration::from_secs(5),
            max_tokens: 128,
            temperature: 0.5,
        }
    }

    #[tokio::test]
    async fn successful_call_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "test-model",
                "stream": false,
                "max_tokens": 128
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 7, "completion_tokens": 1}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = CompletionClient::new(config(
            format!("{}/v1/chat/completions", server.url()),
            Some(AuthHeader::bearer("sk-test")),
        ))
        .expect("client");
        let completion = client
            .complete(&[ChatMessage::user("hi")])
            .await
            .expect("completion");

        mock.assert_async().await;
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.usage.prompt_tokens, 7);

        let diags = client.recent_diagnostics();
        assert_eq!(diags.len(), 1);
        assert!(diags[0].ok);
        assert_eq!(diags[0].status, Some(200));
        assert!(diags[0].request_bytes > 0);
    }

    #[tokio::test]
    async fn custom_header_without_scheme_sends_raw_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat")
            .match_header("x-api-key", "raw-key")
            .with_status(200)
            .with_body(json!({"choices": [{"message": {"content": "ok"}}]}).to_string())
            .create_async()
            .await;

        let auth = AuthHeader {
            name: "x-api-key".to_string(),
            scheme: String::new(),
            key: "raw-key".to_string(),
        };
        let client = CompletionClient::new(config(format!("{}/chat", server.url()), Some(auth)))
            .expect("client");
        client
            .complete(&[ChatMessage::user("hi")])
            .await
            .expect("completion");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_an_error_and_recorded() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let client =
            CompletionClient::new(config(format!("{}/chat", server.url()), None)).expect("client");
        let err = client
            .complete(&[ChatMessage::user("hi")])
            .await
            .expect_err("503 should fail");
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("overloaded"));

        let diags = client.recent_diagnostics();
        assert_eq!(diags.len(), 1);
        assert!(!diags[0].ok);
        assert_eq!(diags[0].status, Some(503));
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        // Nothing listens on port 9 locally.
        let client = CompletionClient::new(config("http://127.0.0.1:9/chat".to_string(), None))
            .expect("client");
        let err = client
            .complete(&[ChatMessage::user("hi")])
            .await
            .expect_err("connection refused");
        assert!(matches!(err, LlmError::Http(_)));
        assert_eq!(client.recent_diagnostics()[0].status, None);
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let err = CompletionClient::new(config(String::new(), None)).err();
        assert!(matches!(err, Some(LlmError::InvalidInput(_))));
    }

    #[test]
    fn auth_header_debug_redacts_key() {
        let rendered = format!("{:?}", AuthHeader::bearer("secret"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        let out = truncate_body(&body);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 515);
    }
}
