//! Prompt builders for SQL generation and repair, plus extraction of a SQL
//! candidate from free-form model output.

/// System + user prompt pair for one generation attempt.
#[derive(Debug, Clone)]
pub struct SqlPrompts {
    pub system: String,
    pub user: String,
}

/// Build the generation prompts.
///
/// The repair block is present only when a previous attempt failed; the
/// scope constraint line only when the caller supplied a non-empty scope.
pub fn build_sql_generation_prompts(
    question: &str,
    schema_grounding_text: &str,
    top_k: i64,
    project_scope: Option<&[i64]>,
    previous_sql: Option<&str>,
    previous_error: Option<&str>,
) -> SqlPrompts {
    let system = "You are a strict PostgreSQL Text-to-SQL generator. \
                  Return SQL only. Never add markdown, explanation, or comments. \
                  Always output a single SELECT query."
        .to_string();

    let mut user = String::new();
    user.push_str("Generate one PostgreSQL SELECT statement for this user question.\n");
    user.push_str(&format!("Question: {question}\n\n"));
    user.push_str("Hard constraints:\n");
    user.push_str("1) SELECT-only query. Never generate INSERT/UPDATE/DELETE/DDL.\n");
    user.push_str("2) Use only tables listed in schema grounding.\n");
    user.push_str("3) Include a WHERE clause to avoid full table scans.\n");
    user.push_str(&format!("4) Include LIMIT <= {top_k}.\n"));
    user.push_str("5) Keep UNION count <= 3 and subquery nesting depth <= 2.\n");
    user.push_str("6) Keep column/table names exact.\n");

    if let Some(scope) = project_scope.filter(|scope| !scope.is_empty()) {
        let mut ids: Vec<i64> = scope.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let ids_text = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        user.push_str(&format!(
            "7) Enforce row-level scope by restricting project identifier \
             to ProjectID / ProjectID_FK in ({ids_text}).\n"
        ));
    }

    user.push_str(&format!("\nSchema grounding:\n{schema_grounding_text}"));

    if let Some(error) = previous_error {
        user.push_str("\n\nPrevious attempt failed. Repair the query.");
        user.push_str(&format!(
            "\nPrevious SQL:\n{}",
            previous_sql.unwrap_or("(none)")
        ));
        user.push_str(&format!("\nDatabase/Error feedback:\n{error}"));
    }

    SqlPrompts { system, user }
}

/// Pull a SQL candidate out of whatever the model returned.
///
/// Code fences and a leading `sql` language tag are stripped; the text from
/// the first SELECT/WITH keyword onward is returned with any trailing
/// semicolon trimmed. When neither keyword occurs, the raw trimmed text is
/// returned and left for the guard to reject.
pub fn extract_sql_from_output(content: &str) -> String {
    let mut text = content.trim();
    if text.starts_with("```") {
        text = text.trim_matches('`').trim();
        if text
            .get(..3)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("sql"))
        {
            text = text[3..].trim();
        }
    }

    let select_index = find_keyword_ci(text, "SELECT");
    let with_index = find_keyword_ci(text, "WITH");

    let start = match (with_index, select_index) {
        (Some(w), Some(s)) if w < s => Some(w),
        (Some(w), None) => Some(w),
        (_, Some(s)) => Some(s),
        (None, None) => None,
    };

    match start {
        Some(index) => text[index..].trim().trim_end_matches(';').to_string(),
        None => text.to_string(),
    }
}

/// First case-insensitive occurrence of an ASCII keyword, as a char-boundary
/// byte index into `text`. Searching `text` directly keeps the index valid
/// for slicing; an index computed on an uppercased copy would not be, since
/// uppercasing can change byte lengths.
fn find_keyword_ci(text: &str, keyword: &str) -> Option<usize> {
    text.char_indices().find_map(|(index, _)| {
        text.get(index..index + keyword.len())
            .filter(|candidate| candidate.eq_ignore_ascii_case(keyword))
            .map(|_| index)
    })
}
