//! Chat-completion providers.
//!
//! The SQL pipeline needs exactly one model operation: system + user prompt
//! in, raw completion text out. Both hosted providers are served by a single
//! client; the request body shape and the path to the reply text are the
//! only per-provider differences, so both live here.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::generator::LlmClient;

const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Hosted provider generating SQL candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// Anthropic Claude (default)
    #[default]
    Anthropic,
    /// OpenAI, or any gateway speaking its chat-completions API
    OpenAi,
}

impl ProviderKind {
    /// Select from `AGENT_BACKEND`; unset means Anthropic.
    pub fn from_env() -> Result<Self> {
        match std::env::var("AGENT_BACKEND") {
            Err(_) => Ok(ProviderKind::Anthropic),
            Ok(value) => Self::parse(&value),
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" | "gpt" => Ok(ProviderKind::OpenAi),
            other => bail!("unknown AGENT_BACKEND '{other}' (expected anthropic or openai)"),
        }
    }

    fn label(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::OpenAi => "OpenAI",
        }
    }
}

/// Chat client for the selected provider.
pub struct ChatModelClient {
    kind: ProviderKind,
    http: reqwest::Client,
    api_key: String,
    model: String,
    openai_base_url: String,
}

impl ChatModelClient {
    /// Explicit construction; the model falls back to the provider default.
    pub fn for_provider(kind: ProviderKind, api_key: String, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| {
            match kind {
                ProviderKind::Anthropic => ANTHROPIC_DEFAULT_MODEL,
                ProviderKind::OpenAi => OPENAI_DEFAULT_MODEL,
            }
            .to_string()
        });
        Self {
            kind,
            http: reqwest::Client::new(),
            api_key,
            model,
            openai_base_url: OPENAI_DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Backend, API key, model, and base URL all come from the environment
    /// (`AGENT_BACKEND`, `ANTHROPIC_API_KEY`/`OPENAI_API_KEY`,
    /// `ANTHROPIC_MODEL`/`OPENAI_MODEL`, `OPENAI_BASE_URL`).
    pub fn from_env() -> Result<Self> {
        let kind = ProviderKind::from_env()?;
        let (key_var, model_var) = match kind {
            ProviderKind::Anthropic => ("ANTHROPIC_API_KEY", "ANTHROPIC_MODEL"),
            ProviderKind::OpenAi => ("OPENAI_API_KEY", "OPENAI_MODEL"),
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| anyhow!("{key_var} environment variable not set"))?;

        let mut client = Self::for_provider(kind, api_key, std::env::var(model_var).ok());
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            client.openai_base_url = base_url;
        }
        Ok(client)
    }

    async fn send(&self, system_prompt: &str, user_prompt: &str) -> Result<Value> {
        let request = match self.kind {
            ProviderKind::Anthropic => self
                .http
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&json!({
                    "model": &self.model,
                    "max_tokens": 2048,
                    "system": system_prompt,
                    "messages": [{"role": "user", "content": user_prompt}],
                })),
            ProviderKind::OpenAi => self
                .http
                .post(format!("{}/chat/completions", self.openai_base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&json!({
                    "model": &self.model,
                    "messages": [
                        {"role": "system", "content": system_prompt},
                        {"role": "user", "content": user_prompt},
                    ],
                    "temperature": 0.1,
                })),
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("{} API error {}: {}", self.kind.label(), status, body);
        }
        response
            .json::<Value>()
            .await
            .with_context(|| format!("{} returned unparseable JSON", self.kind.label()))
    }

    /// Where the reply text lives in each provider's response body.
    fn reply_pointer(&self) -> &'static str {
        match self.kind {
            ProviderKind::Anthropic => "/content/0/text",
            ProviderKind::OpenAi => "/choices/0/message/content",
        }
    }
}

#[async_trait]
impl LlmClient for ChatModelClient {
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = self.send(system_prompt, user_prompt).await?;
        body.pointer(self.reply_pointer())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("{} reply had no text content", self.kind.label()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        self.kind.label()
    }
}

/// Build the environment-selected client as the generator's trait object.
pub fn create_llm_client() -> Result<Arc<dyn LlmClient>> {
    Ok(Arc::new(ChatModelClient::from_env()?))
}
