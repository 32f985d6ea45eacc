//! One-shot query runner: ask a natural-language question from the command
//! line and print the formatted result table.
//!
//! Expects the provider API key (per `AGENT_BACKEND`) and a readonly
//! database URL in the environment.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use labsql::{
    create_llm_client, DatabaseConfig, LlmSqlGenerator, QueryRequest, SqlAgentConfig,
    SqlReadonlyExecutor, TextToSqlService,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let question = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        bail!("usage: labsql_query <question>");
    }

    let agent_config = SqlAgentConfig::default();
    let pool = DatabaseConfig::default()
        .connect()
        .await
        .context("failed to connect readonly pool")?;

    let client = create_llm_client().context("failed to create LLM client")?;
    let generator = Arc::new(LlmSqlGenerator::new(client));
    let executor =
        SqlReadonlyExecutor::new(pool, Duration::from_secs(agent_config.timeout_seconds));
    let service = TextToSqlService::with_readonly_executor(generator, executor, &agent_config);

    let response = service
        .run_query(QueryRequest {
            question,
            top_k: 100,
            project_scope: None,
        })
        .await?;

    println!("SQL: {}", response.sql);
    if let Some(warning) = &response.warning {
        println!("Warning: {warning}");
    }
    println!(
        "Retries: {}  Duration: {}ms\n",
        response.retries, response.duration_ms
    );
    println!("{}", response.formatted_text);

    Ok(())
}
