//! SQL Generator
//!
//! The generator collaborator the orchestrator depends on. Any non-empty
//! text an implementation returns is a candidate SQL string regardless of
//! well-formedness; only the safety guard decides what executes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::prompting::{build_sql_generation_prompts, extract_sql_from_output};
use crate::error::AgentSqlError;

/// Chat-completion seam the generator drives. Implemented by
/// [`ChatModelClient`](super::providers::ChatModelClient); tests substitute
/// scripted impls.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// System + user prompt in, raw completion text out.
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> anyhow::Result<String>;

    /// Model name for logging.
    fn model_name(&self) -> &str;

    /// Provider name for logging and failure messages.
    fn provider_name(&self) -> &str;
}

/// Inputs for one generation attempt. `previous_sql` / `previous_error`
/// carry validator or executor feedback from the second attempt on.
#[derive(Debug, Clone, Copy)]
pub struct GenerationContext<'a> {
    pub question: &'a str,
    pub grounding_text: &'a str,
    pub top_k: i64,
    pub project_scope: Option<&'a [i64]>,
    pub previous_sql: Option<&'a str>,
    pub previous_error: Option<&'a str>,
}

/// Produces candidate SQL from a natural-language question.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, ctx: &GenerationContext<'_>) -> Result<String, AgentSqlError>;
}

/// LLM-backed generator: builds prompts, calls the client, extracts SQL.
pub struct LlmSqlGenerator {
    client: Arc<dyn LlmClient>,
}

impl LlmSqlGenerator {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(&self, ctx: &GenerationContext<'_>) -> Result<String, AgentSqlError> {
        let prompts = build_sql_generation_prompts(
            ctx.question,
            ctx.grounding_text,
            ctx.top_k,
            ctx.project_scope,
            ctx.previous_sql,
            ctx.previous_error,
        );

        let raw = self
            .client
            .chat(&prompts.system, &prompts.user)
            .await
            .map_err(|error| {
                AgentSqlError::upstream(format!(
                    "{} call failed: {error}",
                    self.client.provider_name()
                ))
            })?;

        debug!(
            provider = self.client.provider_name(),
            model = self.client.model_name(),
            raw_len = raw.len(),
            "received generator output"
        );

        let candidate = extract_sql_from_output(&raw);
        if candidate.is_empty() {
            return Err(AgentSqlError::policy("LLM returned empty SQL"));
        }
        Ok(candidate)
    }
}
