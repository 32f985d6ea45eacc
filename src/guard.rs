//! SQL safety guard.
//!
//! Pure validator for generated SQL: same input, same verdict, no I/O.
//! Returns the normalized SQL string that the executor must receive, or a
//! [`AgentSqlError::PolicyViolation`] naming the first rule that failed.
//!
//! The string scanning here is deliberately approximate: the grammar is
//! bounded by the allowlist, so a word-boundary scan over the whole text is
//! the acceptance contract, not a shortcut. A keyword match inside a string
//! literal still rejects.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AgentSqlError;
use crate::policy::AllowlistPolicy;

static DISALLOWED_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|TRUNCATE|CREATE|MERGE|GRANT|REVOKE|COPY|VACUUM|ANALYZE)\b",
    )
    .expect("disallowed keyword pattern")
});

static TABLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+([\w."]+)"#).expect("table reference pattern")
});

static UNION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bUNION(?:\s+ALL)?\b").expect("union pattern"));

static LINE_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)--.*?$").expect("line comment pattern"));

static BLOCK_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("block comment pattern"));

/// Validates candidate SQL against an [`AllowlistPolicy`].
#[derive(Debug, Clone)]
pub struct SqlSafetyGuard {
    policy: AllowlistPolicy,
}

impl SqlSafetyGuard {
    pub fn new(policy: AllowlistPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AllowlistPolicy {
        &self.policy
    }

    /// Validate a candidate SQL string.
    ///
    /// Checks run in a fixed order and the first failure wins. On success
    /// the *returned* normalized string is the only form that may be handed
    /// to the executor.
    pub fn validate(&self, candidate: &str) -> Result<String, AgentSqlError> {
        let sanitized = Self::normalize(candidate)?;
        let upper = sanitized.to_uppercase();

        Self::ensure_single_statement(&sanitized)?;
        Self::ensure_readonly_statement(&upper)?;
        Self::ensure_disallowed_keywords_absent(&upper)?;
        self.ensure_allowlist_tables(&sanitized)?;
        self.ensure_union_limit(&upper)?;
        self.ensure_subquery_depth(&upper)?;
        self.ensure_where_clause(&upper)?;

        Ok(sanitized)
    }

    /// Trim, strip comments, strip one trailing semicolon.
    fn normalize(sql: &str) -> Result<String, AgentSqlError> {
        let compact = sql.trim();
        if compact.is_empty() {
            return Err(AgentSqlError::policy("Generated SQL is empty"));
        }

        let compact = LINE_COMMENT.replace_all(compact, "");
        let compact = BLOCK_COMMENT.replace_all(&compact, "");
        let mut compact = compact.trim().to_string();
        if let Some(stripped) = compact.strip_suffix(';') {
            compact = stripped.trim().to_string();
        }

        if compact.is_empty() {
            return Err(AgentSqlError::policy(
                "Generated SQL is empty after normalization",
            ));
        }
        Ok(compact)
    }

    fn ensure_single_statement(sql: &str) -> Result<(), AgentSqlError> {
        if sql.contains(';') {
            return Err(AgentSqlError::policy(
                "Multiple SQL statements are not allowed",
            ));
        }
        Ok(())
    }

    fn ensure_readonly_statement(upper: &str) -> Result<(), AgentSqlError> {
        if !upper.starts_with("SELECT ") && !upper.starts_with("WITH ") {
            return Err(AgentSqlError::policy("Only SELECT queries are allowed"));
        }
        Ok(())
    }

    fn ensure_disallowed_keywords_absent(upper: &str) -> Result<(), AgentSqlError> {
        if let Some(captures) = DISALLOWED_KEYWORDS.captures(upper) {
            return Err(AgentSqlError::policy(format!(
                "Disallowed SQL keyword detected: {}",
                &captures[1]
            )));
        }
        Ok(())
    }

    fn ensure_allowlist_tables(&self, sql: &str) -> Result<(), AgentSqlError> {
        let referenced = Self::extract_tables(sql);
        if referenced.is_empty() {
            return Err(AgentSqlError::policy("No table reference found in SQL query"));
        }

        let mut blocked: Vec<String> = referenced
            .into_iter()
            .filter(|table| !self.policy.permits(table))
            .collect();
        if !blocked.is_empty() {
            blocked.sort();
            blocked.dedup();
            return Err(AgentSqlError::policy(format!(
                "Referenced table is not in allowlist: {}",
                blocked.join(", ")
            )));
        }
        Ok(())
    }

    fn ensure_union_limit(&self, upper: &str) -> Result<(), AgentSqlError> {
        let union_count = UNION_PATTERN.find_iter(upper).count();
        if union_count > self.policy.max_union_count {
            return Err(AgentSqlError::policy(format!(
                "UNION count exceeded: {} > {}",
                union_count, self.policy.max_union_count
            )));
        }
        Ok(())
    }

    fn ensure_subquery_depth(&self, upper: &str) -> Result<(), AgentSqlError> {
        let max_depth = Self::max_select_parenthesis_depth(upper);
        if max_depth > self.policy.max_subquery_depth {
            return Err(AgentSqlError::policy(format!(
                "Subquery nesting exceeded: {} > {}",
                max_depth, self.policy.max_subquery_depth
            )));
        }
        Ok(())
    }

    fn ensure_where_clause(&self, upper: &str) -> Result<(), AgentSqlError> {
        if self.policy.require_where && !format!(" {upper} ").contains(" WHERE ") {
            return Err(AgentSqlError::policy(
                "Query must include a WHERE clause to avoid full scans",
            ));
        }
        Ok(())
    }

    /// Table names following FROM/JOIN, unquoted and without schema prefix.
    fn extract_tables(sql: &str) -> Vec<String> {
        let mut tables = Vec::new();
        for captures in TABLE_PATTERN.captures_iter(sql) {
            let raw = captures[1].trim();
            // A parenthesis here means the FROM/JOIN opens a subquery.
            if raw.starts_with('(') {
                continue;
            }
            let normalized = Self::normalize_table_name(raw);
            if !normalized.is_empty() {
                tables.push(normalized);
            }
        }
        tables
    }

    fn normalize_table_name(raw: &str) -> String {
        let name = raw.trim().trim_matches('"');
        let name = match name.rsplit_once('.') {
            Some((_, last)) => last,
            None => name,
        };
        name.trim_matches('"').to_string()
    }

    /// Maximum parenthesis depth at which a standalone SELECT token occurs.
    /// Depth 0 is the outermost SELECT.
    fn max_select_parenthesis_depth(upper: &str) -> usize {
        let bytes = upper.as_bytes();
        let mut depth: usize = 0;
        let mut max_select_depth: usize = 0;
        let mut idx = 0;

        while idx < bytes.len() {
            match bytes[idx] {
                b'(' => {
                    depth += 1;
                    idx += 1;
                    continue;
                }
                b')' => {
                    depth = depth.saturating_sub(1);
                    idx += 1;
                    continue;
                }
                _ => {}
            }

            if bytes[idx..].starts_with(b"SELECT") {
                let prev_is_word = idx > 0 && is_word_byte(bytes[idx - 1]);
                let next_is_word = bytes
                    .get(idx + 6)
                    .is_some_and(|&b| is_word_byte(b));
                if !prev_is_word && !next_is_word {
                    max_select_depth = max_select_depth.max(depth);
                    idx += 6;
                    continue;
                }
            }

            idx += 1;
        }

        max_select_depth
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SqlSafetyGuard {
        SqlSafetyGuard::new(AllowlistPolicy::new(
            [
                "tbl_ProjectInfo",
                "tbl_FormulaComposition",
                "tbl_RawMaterials",
            ],
            2,
            3,
            true,
        ))
    }

    // ── normalization ─────────────────────────────────────────

    #[test]
    fn strips_comments_and_trailing_semicolon() {
        let sql = "SELECT \"ProjectID\" FROM \"tbl_ProjectInfo\" -- trailing note\nWHERE \"ProjectID\" = 1;";
        let validated = guard().validate(sql).unwrap();
        assert!(!validated.contains("--"));
        assert!(!validated.ends_with(';'));
    }

    #[test]
    fn strips_block_comments() {
        let sql = "SELECT /* hidden\ncomment */ \"ProjectID\" FROM tbl_ProjectInfo WHERE \"ProjectID\" = 1";
        let validated = guard().validate(sql).unwrap();
        assert!(!validated.contains("/*"));
    }

    #[test]
    fn rejects_empty_input() {
        let err = guard().validate("   ").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn rejects_comment_only_input() {
        let err = guard().validate("-- nothing here\n/* or here */").unwrap_err();
        assert!(err.to_string().contains("empty after normalization"));
    }

    // ── statement shape ───────────────────────────────────────

    #[test]
    fn rejects_statement_stacking() {
        let err = guard()
            .validate("SELECT * FROM tbl_ProjectInfo WHERE 1=1; SELECT * FROM tbl_RawMaterials WHERE 1=1")
            .unwrap_err();
        assert!(err.to_string().contains("Multiple SQL statements"));
    }

    #[test]
    fn rejects_non_select() {
        let err = guard()
            .validate("EXPLAIN SELECT * FROM tbl_ProjectInfo WHERE 1=1")
            .unwrap_err();
        assert!(err.to_string().contains("Only SELECT"));
    }

    #[test]
    fn accepts_with_cte() {
        let sql = "WITH recent AS (SELECT * FROM tbl_ProjectInfo WHERE \"FormulationDate\" > '2024-01-01') SELECT * FROM recent WHERE \"ProjectID\" = 1";
        // CTE alias `recent` is not allowlisted, so table extraction rejects it.
        // The read-only shape check itself must pass WITH queries through.
        let err = guard().validate(sql).unwrap_err();
        assert!(err.to_string().contains("allowlist"));
    }

    // ── keyword denylist ──────────────────────────────────────

    #[test]
    fn rejects_every_denylisted_keyword() {
        for keyword in [
            "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "MERGE",
            "GRANT", "REVOKE", "COPY", "VACUUM", "ANALYZE",
        ] {
            let sql = format!(
                "SELECT * FROM tbl_ProjectInfo WHERE \"ProjectName\" = '{}'",
                keyword.to_lowercase()
            );
            let err = guard().validate(&sql).unwrap_err();
            assert!(
                err.to_string().contains("Disallowed SQL keyword"),
                "{keyword} should be rejected, got: {err}"
            );
        }
    }

    #[test]
    fn keyword_scan_ignores_substrings() {
        // "created_at"-style identifiers must not trip the CREATE keyword.
        let sql = "SELECT \"ProjectID\" AS updated_key FROM tbl_ProjectInfo WHERE \"ProjectID\" = 1";
        assert!(guard().validate(sql).is_ok());
    }

    // ── table allowlist ───────────────────────────────────────

    #[test]
    fn scenario_a_quoted_allowlisted_table_passes() {
        let sql = r#"SELECT "ProjectID" FROM "tbl_ProjectInfo" WHERE "ProjectID" = 1"#;
        let validated = guard().validate(sql).unwrap();
        assert!(!validated.ends_with(';'));
        assert_eq!(validated, sql);
    }

    #[test]
    fn scenario_b_unlisted_table_rejected_by_name() {
        let sql = r#"SELECT * FROM "tbl_Users" WHERE "UserID" = 1"#;
        let err = guard().validate(sql).unwrap_err();
        assert!(err.to_string().contains("tbl_Users"), "got: {err}");
    }

    #[test]
    fn schema_qualified_names_are_stripped() {
        let sql = "SELECT * FROM public.tbl_ProjectInfo WHERE \"ProjectID\" = 1";
        assert!(guard().validate(sql).is_ok());
    }

    #[test]
    fn join_tables_are_checked_too() {
        let sql = "SELECT * FROM tbl_ProjectInfo p JOIN tbl_Users u ON u.id = p.\"ProjectID\" WHERE p.\"ProjectID\" = 1";
        let err = guard().validate(sql).unwrap_err();
        assert!(err.to_string().contains("tbl_Users"));
    }

    #[test]
    fn rejects_query_without_table_reference() {
        let err = guard().validate("SELECT 1").unwrap_err();
        assert!(err.to_string().contains("No table reference"));
    }

    #[test]
    fn lists_all_offending_tables_sorted() {
        let sql = "SELECT * FROM tbl_Zeta z JOIN tbl_Alpha a ON a.x = z.x WHERE a.x = 1";
        let err = guard().validate(sql).unwrap_err();
        let text = err.to_string();
        let alpha = text.find("tbl_Alpha").expect("tbl_Alpha named");
        let zeta = text.find("tbl_Zeta").expect("tbl_Zeta named");
        assert!(alpha < zeta);
    }

    // ── union limit ───────────────────────────────────────────

    #[test]
    fn scenario_c_union_boundary_is_inclusive() {
        let base = "SELECT \"ProjectID\" FROM tbl_ProjectInfo WHERE \"ProjectID\" = 1";
        let three_unions = vec![base; 4].join(" UNION ALL ");
        assert!(guard().validate(&three_unions).is_ok());

        let five_unions = vec![base; 6].join(" UNION ");
        let err = guard().validate(&five_unions).unwrap_err();
        assert!(err.to_string().contains("UNION count exceeded"));
    }

    // ── subquery depth ────────────────────────────────────────

    #[test]
    fn scenario_d_depth_boundary() {
        // Depth 2 (SELECT at depths 0, 1, 2) is the configured max: accepted.
        let depth_two = "SELECT * FROM tbl_ProjectInfo WHERE \"ProjectID\" IN \
                         (SELECT \"ProjectID_FK\" FROM tbl_FormulaComposition WHERE \"MaterialID_FK\" IN \
                         (SELECT \"MaterialID\" FROM tbl_RawMaterials WHERE \"Density\" > 1))";
        assert!(guard().validate(depth_two).is_ok());

        // A fourth SELECT nested one level deeper exceeds the budget.
        let depth_three = "SELECT * FROM tbl_ProjectInfo WHERE \"ProjectID\" IN \
                           (SELECT \"ProjectID_FK\" FROM tbl_FormulaComposition WHERE \"MaterialID_FK\" IN \
                           (SELECT \"MaterialID\" FROM tbl_RawMaterials WHERE \"Density\" IN \
                           (SELECT \"Density\" FROM tbl_RawMaterials WHERE \"Density\" > 1)))";
        let err = guard().validate(depth_three).unwrap_err();
        assert!(err.to_string().contains("Subquery nesting exceeded"));
    }

    #[test]
    fn select_inside_identifier_does_not_count() {
        let sql = "SELECT \"PRESELECTED\" FROM tbl_ProjectInfo WHERE \"ProjectID\" = 1";
        assert!(guard().validate(sql).is_ok());
    }

    // ── where requirement ─────────────────────────────────────

    #[test]
    fn rejects_missing_where_clause() {
        let err = guard().validate("SELECT * FROM tbl_ProjectInfo").unwrap_err();
        assert!(err.to_string().contains("WHERE"));
    }

    #[test]
    fn where_not_required_when_policy_relaxed() {
        let relaxed = SqlSafetyGuard::new(AllowlistPolicy::new(["tbl_ProjectInfo"], 2, 3, false));
        assert!(relaxed.validate("SELECT * FROM tbl_ProjectInfo").is_ok());
    }

    // ── determinism ───────────────────────────────────────────

    #[test]
    fn validate_is_idempotent() {
        let sql = r#"SELECT "ProjectID" FROM "tbl_ProjectInfo" WHERE "ProjectID" = 1"#;
        let once = guard().validate(sql).unwrap();
        let twice = guard().validate(&once).unwrap();
        assert_eq!(once, twice);
    }
}
