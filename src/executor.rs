//! Readonly SQL executor with row cap, scope filter, timeout, and
//! transport-safe row serialization.
//!
//! The executor only ever receives SQL that already passed the safety guard;
//! its own wrapping is the second line of defense, applied unconditionally.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, Executor, PgPool, Row, TypeInfo};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AgentSqlError;
use crate::grounding::{SampleProvider, SampleRow};

/// Result of one bounded execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<SampleRow>,
    pub row_count: usize,
    pub duration_ms: u64,
}

/// Execution port the orchestrator talks to; implemented by
/// [`SqlReadonlyExecutor`] and by test doubles.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        top_k: i64,
        project_scope: Option<&[i64]>,
    ) -> Result<ExecutionResult, AgentSqlError>;
}

/// Executes validated SQL against a pooled read-only Postgres connection.
pub struct SqlReadonlyExecutor {
    pool: PgPool,
    timeout: Duration,
}

impl SqlReadonlyExecutor {
    /// The pool handle is constructed by the host and injected here; the
    /// executor checks connections out per call and never holds one across
    /// a generator call.
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Wrap as `SELECT * FROM (<sql>) AS agent_sql_result LIMIT n` with
    /// `n = clamp(top_k, 1, 1000)`. The clamp is unconditional.
    fn wrap_with_limit(sql: &str, top_k: i64) -> String {
        let bounded_rows = top_k.clamp(1, 1000);
        let stripped = sql.trim().trim_end_matches(';');
        format!("SELECT * FROM ({stripped}) AS agent_sql_result LIMIT {bounded_rows}")
    }

    /// Restrict visible rows to the caller's project scope.
    ///
    /// `ProjectID` is tried before `ProjectID_FK`; a row exposing neither as
    /// a numeric value casts to NULL and is excluded — the filter fails
    /// closed.
    fn apply_project_scope_filter(sql: String, project_scope: Option<&[i64]>) -> String {
        let scope_ids = Self::sanitize_project_scope(project_scope);
        if scope_ids.is_empty() {
            return sql;
        }

        let scope_text = scope_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT * FROM ({sql}) AS agent_scope_result \
             WHERE (CASE \
             WHEN (to_jsonb(agent_scope_result)->>'ProjectID') ~ '^[0-9]+$' \
             THEN (to_jsonb(agent_scope_result)->>'ProjectID')::int \
             WHEN (to_jsonb(agent_scope_result)->>'ProjectID_FK') ~ '^[0-9]+$' \
             THEN (to_jsonb(agent_scope_result)->>'ProjectID_FK')::int \
             ELSE NULL END) \
             IN ({scope_text})"
        )
    }

    /// Positive ids only, deduplicated, ascending.
    pub(crate) fn sanitize_project_scope(project_scope: Option<&[i64]>) -> Vec<i64> {
        let Some(scope) = project_scope else {
            return Vec::new();
        };
        let mut ids: Vec<i64> = scope.iter().copied().filter(|id| *id > 0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn is_safe_table_name(table_name: &str) -> bool {
        !table_name.is_empty()
            && table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Execute validated SQL, bounded by row cap, scope filter, and timeout.
    pub async fn execute(
        &self,
        sql: &str,
        top_k: i64,
        project_scope: Option<&[i64]>,
    ) -> Result<ExecutionResult, AgentSqlError> {
        let bounded_sql = Self::wrap_with_limit(sql, top_k);
        let scoped_sql = Self::apply_project_scope_filter(bounded_sql, project_scope);
        debug!(sql = %scoped_sql, "executing bounded query");

        let started_at = Instant::now();
        // Dropping the in-flight future on timeout cancels the statement;
        // the pool discards the connection instead of reusing it mid-query.
        let fetched = tokio::time::timeout(
            self.timeout,
            sqlx::query(&scoped_sql).fetch_all(&self.pool),
        )
        .await;

        let rows = match fetched {
            Err(_) => {
                return Err(AgentSqlError::timeout(format!(
                    "Readonly SQL execution timed out in {}s",
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(error)) => {
                return Err(AgentSqlError::driver(format!(
                    "Readonly SQL execution failed: {error}"
                )));
            }
            Ok(Ok(rows)) => rows,
        };

        let columns = match rows.first() {
            Some(row) => row
                .columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect(),
            None => self.describe_columns(&scoped_sql).await?,
        };
        let serialized: Vec<SampleRow> = rows.iter().map(Self::serialize_row).collect();

        let duration_ms = started_at.elapsed().as_millis() as u64;
        Ok(ExecutionResult {
            columns,
            row_count: serialized.len(),
            rows: serialized,
            duration_ms,
        })
    }

    /// Column names for a statement that returned no rows, recovered under
    /// the same execution deadline as the statement itself.
    async fn describe_columns(&self, sql: &str) -> Result<Vec<String>, AgentSqlError> {
        let described = tokio::time::timeout(self.timeout, self.pool.describe(sql)).await;
        match described {
            Err(_) => Err(AgentSqlError::timeout(format!(
                "Readonly SQL describe timed out in {}s",
                self.timeout.as_secs()
            ))),
            Ok(Err(error)) => {
                warn!(%error, "failed to describe empty result set");
                Ok(Vec::new())
            }
            Ok(Ok(description)) => Ok(description
                .columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect()),
        }
    }

    fn serialize_row(row: &PgRow) -> SampleRow {
        let mut map = SampleRow::new();
        for column in row.columns() {
            map.insert(
                column.name().to_string(),
                Self::serialize_value(row, column.ordinal(), column.type_info().name()),
            );
        }
        map
    }

    /// Convert one cell into a transport-safe JSON value: decimals become
    /// floats, temporal values become ISO-8601 strings, NULL becomes null.
    fn serialize_value(row: &PgRow, ordinal: usize, type_name: &str) -> Value {
        let value: Option<Value> = match type_name {
            "UUID" => row
                .try_get::<Option<Uuid>, _>(ordinal)
                .ok()
                .flatten()
                .map(|u| json!(u.to_string())),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(ordinal)
                .ok()
                .flatten()
                .map(|s| json!(s)),
            "INT2" => row
                .try_get::<Option<i16>, _>(ordinal)
                .ok()
                .flatten()
                .map(|i| json!(i)),
            "INT4" => row
                .try_get::<Option<i32>, _>(ordinal)
                .ok()
                .flatten()
                .map(|i| json!(i)),
            "INT8" => row
                .try_get::<Option<i64>, _>(ordinal)
                .ok()
                .flatten()
                .map(|i| json!(i)),
            "FLOAT4" | "FLOAT8" => row
                .try_get::<Option<f64>, _>(ordinal)
                .ok()
                .flatten()
                .map(|f| json!(f)),
            "NUMERIC" => row
                .try_get::<Option<Decimal>, _>(ordinal)
                .ok()
                .flatten()
                .map(|d| match d.to_f64() {
                    Some(f) => json!(f),
                    None => json!(d.to_string()),
                }),
            "BOOL" => row
                .try_get::<Option<bool>, _>(ordinal)
                .ok()
                .flatten()
                .map(|b| json!(b)),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(ordinal).ok().flatten(),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(ordinal)
                .ok()
                .flatten()
                .map(|dt| json!(dt.to_rfc3339())),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(ordinal)
                .ok()
                .flatten()
                .map(|dt| json!(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(ordinal)
                .ok()
                .flatten()
                .map(|d| json!(d.to_string())),
            "TIME" => row
                .try_get::<Option<NaiveTime>, _>(ordinal)
                .ok()
                .flatten()
                .map(|t| json!(t.to_string())),
            _ => row
                .try_get::<Option<String>, _>(ordinal)
                .ok()
                .flatten()
                .map(|s| json!(s)),
        };
        value.unwrap_or(Value::Null)
    }
}

#[async_trait]
impl QueryExecutor for SqlReadonlyExecutor {
    async fn execute(
        &self,
        sql: &str,
        top_k: i64,
        project_scope: Option<&[i64]>,
    ) -> Result<ExecutionResult, AgentSqlError> {
        SqlReadonlyExecutor::execute(self, sql, top_k, project_scope).await
    }
}

#[async_trait]
impl SampleProvider for SqlReadonlyExecutor {
    /// One bounded `SELECT * FROM "<table>" LIMIT 1` per table. Table names
    /// are validated before interpolation even though only policy-listed
    /// names ever arrive here.
    async fn fetch_sample_rows(
        &self,
        table_names: &[String],
    ) -> anyhow::Result<HashMap<String, SampleRow>> {
        let mut samples = HashMap::new();

        for table_name in table_names {
            if !Self::is_safe_table_name(table_name) {
                warn!(table = %table_name, "skipping unsafe table name for sample fetch");
                continue;
            }
            let sql = format!(r#"SELECT * FROM "{table_name}" LIMIT 1"#);
            let fetched = tokio::time::timeout(
                self.timeout,
                sqlx::query(&sql).fetch_optional(&self.pool),
            )
            .await;

            match fetched {
                Ok(Ok(Some(row))) => {
                    samples.insert(table_name.clone(), Self::serialize_row(&row));
                }
                Ok(Ok(None)) => {}
                Ok(Err(error)) => {
                    warn!(table = %table_name, %error, "failed to fetch sample row");
                }
                Err(_) => {
                    warn!(table = %table_name, "sample row fetch timed out");
                }
            }
        }

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── limit wrapping ────────────────────────────────────────

    #[test]
    fn limit_clamps_low_values() {
        let wrapped = SqlReadonlyExecutor::wrap_with_limit("SELECT 1 FROM t WHERE x = 1", 0);
        assert!(wrapped.ends_with("LIMIT 1"), "{wrapped}");
        let wrapped = SqlReadonlyExecutor::wrap_with_limit("SELECT 1 FROM t WHERE x = 1", -5);
        assert!(wrapped.ends_with("LIMIT 1"));
    }

    #[test]
    fn limit_clamps_high_values() {
        let wrapped = SqlReadonlyExecutor::wrap_with_limit("SELECT 1 FROM t WHERE x = 1", 9999);
        assert!(wrapped.ends_with("LIMIT 1000"));
    }

    #[test]
    fn limit_keeps_in_range_values() {
        let wrapped = SqlReadonlyExecutor::wrap_with_limit("SELECT 1 FROM t WHERE x = 1", 25);
        assert!(wrapped.ends_with("LIMIT 25"));
    }

    #[test]
    fn limit_wrap_strips_trailing_semicolon() {
        let wrapped = SqlReadonlyExecutor::wrap_with_limit("SELECT 1 FROM t WHERE x = 1;", 10);
        assert_eq!(
            wrapped,
            "SELECT * FROM (SELECT 1 FROM t WHERE x = 1) AS agent_sql_result LIMIT 10"
        );
    }

    // ── scope filter ──────────────────────────────────────────

    #[test]
    fn empty_scope_leaves_sql_unchanged() {
        let sql = "SELECT * FROM (x) AS agent_sql_result LIMIT 10".to_string();
        assert_eq!(
            SqlReadonlyExecutor::apply_project_scope_filter(sql.clone(), None),
            sql
        );
        assert_eq!(
            SqlReadonlyExecutor::apply_project_scope_filter(sql.clone(), Some(&[])),
            sql
        );
    }

    #[test]
    fn scope_filter_wraps_with_case_expression() {
        let sql = "SELECT * FROM (x) AS agent_sql_result LIMIT 10".to_string();
        let scoped = SqlReadonlyExecutor::apply_project_scope_filter(sql, Some(&[3, 1, 1]));
        assert!(scoped.contains("agent_scope_result"));
        assert!(scoped.contains("->>'ProjectID'"));
        assert!(scoped.contains("->>'ProjectID_FK'"));
        assert!(scoped.contains("ELSE NULL END"));
        assert!(scoped.ends_with("IN (1, 3)"));
        // ProjectID must be tried before ProjectID_FK.
        let id_pos = scoped.find("->>'ProjectID')").unwrap();
        let fk_pos = scoped.find("->>'ProjectID_FK')").unwrap();
        assert!(id_pos < fk_pos);
    }

    #[test]
    fn scope_sanitization_drops_non_positive_and_duplicates() {
        assert_eq!(
            SqlReadonlyExecutor::sanitize_project_scope(Some(&[5, -1, 0, 5, 2])),
            vec![2, 5]
        );
        assert!(SqlReadonlyExecutor::sanitize_project_scope(None).is_empty());
    }

    // ── sample table name validation ──────────────────────────

    #[test]
    fn safe_table_names() {
        assert!(SqlReadonlyExecutor::is_safe_table_name("tbl_ProjectInfo"));
        assert!(SqlReadonlyExecutor::is_safe_table_name("tbl_TestResults_3DPrint"));
        assert!(!SqlReadonlyExecutor::is_safe_table_name(""));
        assert!(!SqlReadonlyExecutor::is_safe_table_name("tbl\"; DROP TABLE x"));
        assert!(!SqlReadonlyExecutor::is_safe_table_name("schema.table"));
    }
}
