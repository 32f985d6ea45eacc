//! Text-to-SQL orchestration service.
//!
//! Composition root for the pipeline: grounding → generator → guard →
//! executor, with a bounded retry loop that folds each failure back into
//! the next generation attempt. This is the only place that decides
//! retry-vs-propagate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agentic::{GenerationContext, SqlGenerator};
use crate::config::SqlAgentConfig;
use crate::error::AgentSqlError;
use crate::executor::{QueryExecutor, SqlReadonlyExecutor};
use crate::format::format_result_table;
use crate::grounding::{build_snapshot, render_snapshot, SampleProvider, SampleRow};
use crate::guard::SqlSafetyGuard;
use crate::policy::AllowlistPolicy;

/// One natural-language query on behalf of a scoped caller.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    pub top_k: i64,
    /// Record identifiers the caller may see; absent means unrestricted.
    pub project_scope: Option<Vec<i64>>,
}

/// Successful pipeline outcome.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    /// The guard-normalized SQL that actually executed.
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<SampleRow>,
    pub row_count: usize,
    /// Retries actually used (0 when the first attempt succeeded).
    pub retries: usize,
    /// The prior attempt's failure when the query only succeeded on retry.
    pub warning: Option<String>,
    pub duration_ms: u64,
    pub formatted_text: String,
}

/// Generate, validate, and execute SQL from natural language.
pub struct TextToSqlService {
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn QueryExecutor>,
    sample_provider: Option<Arc<dyn SampleProvider>>,
    guard: SqlSafetyGuard,
    allowlist_tables: Vec<String>,
    max_retries: usize,
}

impl TextToSqlService {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn QueryExecutor>,
        sample_provider: Option<Arc<dyn SampleProvider>>,
        config: &SqlAgentConfig,
    ) -> Self {
        let policy = AllowlistPolicy::new(
            &config.allowlist_tables,
            config.max_subquery_depth,
            config.max_union_count,
            config.require_where,
        );
        Self {
            generator,
            executor,
            sample_provider,
            guard: SqlSafetyGuard::new(policy),
            allowlist_tables: config.allowlist_tables.clone(),
            max_retries: config.max_retries,
        }
    }

    /// Wire the service over a readonly Postgres executor that also serves
    /// as the grounding sample provider.
    pub fn with_readonly_executor(
        generator: Arc<dyn SqlGenerator>,
        executor: SqlReadonlyExecutor,
        config: &SqlAgentConfig,
    ) -> Self {
        let executor = Arc::new(executor);
        let query_executor: Arc<dyn QueryExecutor> = executor.clone();
        let sample_provider: Arc<dyn SampleProvider> = executor;
        Self::new(generator, query_executor, Some(sample_provider), config)
    }

    /// Run one request through the pipeline.
    ///
    /// Attempts are strictly sequential; attempt n+1 never starts before
    /// attempt n's failure is recorded. A candidate that has not passed the
    /// guard never reaches the executor.
    pub async fn run_query(&self, request: QueryRequest) -> Result<QueryResponse, AgentSqlError> {
        let top_k = request.top_k.clamp(1, 1000);
        let scope = request.project_scope.as_deref();

        // Grounding is built once per request, not once per retry.
        let snapshot =
            build_snapshot(self.sample_provider.as_deref(), &self.allowlist_tables).await;
        let grounding_text = render_snapshot(&snapshot);

        let mut retry_count = 0usize;
        let mut previous_sql: Option<String> = None;
        let mut previous_error: Option<String> = None;

        loop {
            let ctx = GenerationContext {
                question: &request.question,
                grounding_text: &grounding_text,
                top_k,
                project_scope: scope,
                previous_sql: previous_sql.as_deref(),
                previous_error: previous_error.as_deref(),
            };

            let candidate = match self.generator.generate(&ctx).await {
                Ok(candidate) => candidate,
                Err(error) if error.is_retryable() && retry_count < self.max_retries => {
                    warn!(attempt = retry_count, %error, "generation attempt rejected");
                    previous_sql = None;
                    previous_error = Some(error.feedback());
                    retry_count += 1;
                    continue;
                }
                Err(error) => return Err(error),
            };

            match self.attempt(&candidate, top_k, scope).await {
                Ok((checked_sql, execution)) => {
                    let formatted_text =
                        format_result_table(&execution.columns, &execution.rows);
                    let warning = if retry_count > 0 {
                        previous_error.clone()
                    } else {
                        None
                    };
                    info!(
                        retries = retry_count,
                        row_count = execution.row_count,
                        duration_ms = execution.duration_ms,
                        "text-to-sql query succeeded"
                    );
                    return Ok(QueryResponse {
                        sql: checked_sql,
                        columns: execution.columns,
                        rows: execution.rows,
                        row_count: execution.row_count,
                        retries: retry_count,
                        warning,
                        duration_ms: execution.duration_ms,
                        formatted_text,
                    });
                }
                Err(error) if error.is_retryable() && retry_count < self.max_retries => {
                    warn!(attempt = retry_count, %error, "attempt failed, retrying with feedback");
                    previous_sql = Some(candidate);
                    previous_error = Some(error.feedback());
                    retry_count += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Validate then execute one candidate. The executor only ever sees the
    /// guard's returned string.
    async fn attempt(
        &self,
        candidate: &str,
        top_k: i64,
        scope: Option<&[i64]>,
    ) -> Result<(String, crate::executor::ExecutionResult), AgentSqlError> {
        let checked_sql = self.guard.validate(candidate)?;
        let execution = self.executor.execute(&checked_sql, top_k, scope).await?;
        Ok((checked_sql, execution))
    }
}
