//! chat-oracle configuration loader.

use oracle_llm::{AuthHeader, CompletionConfig};
use oracle_queue::{QueueConfig, RatePolicy, UserId};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub oracle: LoopConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub rate: RateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Identity the oracle posts, commits and fast-forwards as.
    pub admin: String,
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default = "default_persona")]
    pub persona: String,
    /// Word the persona uses to refer to "the person asking"; never a real mention.
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_trigger() -> String {
    "@ai".to_string()
}

fn default_persona() -> String {
    "You are a helpful participant in a public group chat. Answer briefly and plainly. \
     Refer to the person asking as @tag; never mention other participants."
        .to_string()
}

fn default_placeholder() -> String {
    "@tag".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_header")]
    pub header: String,
    #[serde(default = "default_auth_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub key: Option<String>,
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_auth_scheme() -> String {
    "Bearer".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: default_auth_header(),
            scheme: default_auth_scheme(),
            key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_max_reply_tokens")]
    pub max_reply_tokens: usize,
    #[serde(default = "default_headroom_tokens")]
    pub headroom_tokens: usize,
    /// Prior (prompt, reply) pairs included ahead of the current prompt.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: usize,
    /// Ceiling on the serialized request body.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Ceiling on the replicated rolling summary.
    #[serde(default = "default_summary_max_bytes")]
    pub summary_max_bytes: usize,
    #[serde(default = "default_floor_chars")]
    pub summary_floor_chars: usize,
    #[serde(default = "default_floor_chars")]
    pub prompt_floor_chars: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_context_tokens() -> usize {
    8192
}

fn default_max_reply_tokens() -> usize {
    512
}

fn default_headroom_tokens() -> usize {
    256
}

fn default_history_window() -> usize {
    6
}

fn default_summary_max_tokens() -> usize {
    400
}

fn default_max_request_bytes() -> usize {
    48_000
}

fn default_summary_max_bytes() -> usize {
    2048
}

fn default_floor_chars() -> usize {
    200
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            max_reply_tokens: default_max_reply_tokens(),
            headroom_tokens: default_headroom_tokens(),
            history_window: default_history_window(),
            summary_max_tokens: default_summary_max_tokens(),
            max_request_bytes: default_max_request_bytes(),
            summary_max_bytes: default_summary_max_bytes(),
            summary_floor_chars: default_floor_chars(),
            prompt_floor_chars: default_floor_chars(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Unprocessed slots tolerated before the oldest are fast-forwarded away.
    #[serde(default = "default_max_backlog")]
    pub max_backlog: u64,
    #[serde(default = "default_inflight_ttl_ms")]
    pub inflight_ttl_ms: u64,
    /// TTL breaches tolerated for one slot before it is skipped.
    #[serde(default = "default_inflight_max_retries")]
    pub inflight_max_retries: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_backoff_ms")]
    pub retry_base_backoff_ms: u64,
    #[serde(default = "default_warmup_grace_ms")]
    pub warmup_grace_ms: u64,
    #[serde(default = "default_success_grace_ms")]
    pub success_grace_ms: u64,
    /// How long to wait for our own commit to become visible locally.
    #[serde(default = "default_commit_wait_ms")]
    pub commit_wait_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_backlog() -> u64 {
    50
}

fn default_inflight_ttl_ms() -> u64 {
    120_000
}

fn default_inflight_max_retries() -> u32 {
    1
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_backoff_ms() -> u64 {
    1000
}

fn default_warmup_grace_ms() -> u64 {
    20_000
}

fn default_success_grace_ms() -> u64 {
    10_000
}

fn default_commit_wait_ms() -> u64 {
    5_000
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_backlog: default_max_backlog(),
            inflight_ttl_ms: default_inflight_ttl_ms(),
            inflight_max_retries: default_inflight_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_backoff_ms: default_retry_base_backoff_ms(),
            warmup_grace_ms: default_warmup_grace_ms(),
            success_grace_ms: default_success_grace_ms(),
            commit_wait_ms: default_commit_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_max_message_bytes() -> usize {
    4000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_window_max")]
    pub window_max: usize,
}

fn default_daily_cap() -> u64 {
    RatePolicy::default().daily_cap
}

fn default_window_ms() -> u64 {
    RatePolicy::default().window_ms
}

fn default_window_max() -> usize {
    RatePolicy::default().window_max
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            daily_cap: default_daily_cap(),
            window_ms: default_window_ms(),
            window_max: default_window_max(),
        }
    }
}

impl OracleConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ORACLE_MODEL") {
            if !v.trim().is_empty() {
                self.general.model = v;
            }
        }
        if let Ok(v) = std::env::var("ORACLE_ENDPOINT") {
            if !v.trim().is_empty() {
                self.general.endpoint = v;
            }
        }
        if let Ok(v) = std::env::var("ORACLE_API_KEY") {
            if !v.trim().is_empty() {
                self.auth.key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ORACLE_ADMIN") {
            if !v.trim().is_empty() {
                self.general.admin = v;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.general.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("general.endpoint is required"));
        }
        if self.general.admin.trim().is_empty() {
            return Err(anyhow::anyhow!("general.admin is required"));
        }
        if self.general.trigger.trim().is_empty() {
            return Err(anyhow::anyhow!("general.trigger must not be empty"));
        }
        let reserved = self.context.max_reply_tokens + self.context.headroom_tokens;
        if self.context.max_context_tokens <= reserved {
            return Err(anyhow::anyhow!(
                "context.max_context_tokens ({}) must exceed max_reply_tokens + headroom_tokens ({reserved})",
                self.context.max_context_tokens
            ));
        }
        if self.context.max_request_bytes == 0 {
            return Err(anyhow::anyhow!("context.max_request_bytes must be > 0"));
        }
        if self.oracle.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("oracle.poll_interval_ms must be > 0"));
        }
        if self.oracle.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("oracle.request_timeout_ms must be > 0"));
        }
        if self.oracle.inflight_ttl_ms == 0 {
            return Err(anyhow::anyhow!("oracle.inflight_ttl_ms must be > 0"));
        }
        if self.transport.max_message_bytes < 64 {
            return Err(anyhow::anyhow!("transport.max_message_bytes must be >= 64"));
        }
        if self.rate.window_max == 0 || self.rate.daily_cap == 0 {
            return Err(anyhow::anyhow!("rate.window_max and rate.daily_cap must be > 0"));
        }
        Ok(())
    }

    pub fn admin(&self) -> UserId {
        UserId::new(self.general.admin.trim())
    }

    pub fn queue_config(&self) -> QueueConfig {
        let mut cfg = QueueConfig::new(self.admin());
        cfg.trigger = self.general.trigger.clone();
        cfg.rate = RatePolicy {
            daily_cap: self.rate.daily_cap,
            window_ms: self.rate.window_ms,
            window_max: self.rate.window_max,
        };
        cfg
    }

    pub fn completion_config(&self) -> CompletionConfig {
        let auth = self
            .auth
            .key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .map(|key| AuthHeader {
                name: self.auth.header.clone(),
                scheme: self.auth.scheme.clone(),
                key,
            });
        CompletionConfig {
            endpoint: self.general.endpoint.clone(),
            model: self.general.model.clone(),
            auth,
            timeout: Duration::from_millis(self.oracle.request_timeout_ms),
            max_tokens: u32::try_from(self.context.max_reply_tokens).unwrap_or(u32::MAX),
            temperature: self.context.temperature,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".chat-oracle").join("config.toml")
}
