//! Markdown-style rendering of execution results.
//!
//! The table is capped at the first 20 rows and every cell is escaped so
//! embedded pipes or newlines can never break the layout.

use serde_json::Value;

use crate::grounding::SampleRow;

/// Rows shown in the rendered table; the summary line reports the rest.
const MAX_VISIBLE_ROWS: usize = 20;

/// Render columns/rows as a fixed-width markdown table with a summary line.
pub fn format_result_table(columns: &[String], rows: &[SampleRow]) -> String {
    if columns.is_empty() {
        return "| result |\n| --- |\n| (no columns) |\n\n\
                No structured columns were returned by the query."
            .to_string();
    }

    let visible_rows = &rows[..rows.len().min(MAX_VISIBLE_ROWS)];
    let escaped_columns: Vec<String> = columns
        .iter()
        .map(|column| escape_markdown_cell(Some(&Value::String(column.clone()))))
        .collect();
    let header = format!("| {} |", escaped_columns.join(" | "));
    let separator = format!("| {} |", vec!["---"; columns.len()].join(" | "));

    let mut body_lines: Vec<String> = visible_rows
        .iter()
        .map(|row| {
            let cells: Vec<String> = columns
                .iter()
                .map(|column| escape_markdown_cell(row.get(column)))
                .collect();
            format!("| {} |", cells.join(" | "))
        })
        .collect();

    if body_lines.is_empty() {
        let mut empty_cells = vec!["(no rows)".to_string()];
        empty_cells.resize(columns.len(), String::new());
        body_lines.push(format!("| {} |", empty_cells.join(" | ")));
    }

    let table_text = format!("{header}\n{separator}\n{}", body_lines.join("\n"));

    let total_rows = rows.len();
    let summary = if total_rows == 0 {
        "No rows matched the query.".to_string()
    } else if total_rows > visible_rows.len() {
        format!(
            "Returned {} rows; showing first {} rows.",
            total_rows,
            visible_rows.len()
        )
    } else {
        format!("Returned {total_rows} row(s).")
    };

    format!("{table_text}\n\n{summary}")
}

/// Escape one cell: `NULL` for missing values, pipes escaped, newlines
/// collapsed to spaces.
fn escape_markdown_cell(value: Option<&Value>) -> String {
    let text = match value {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    text.replace("\r\n", " ")
        .replace('\n', " ")
        .replace('\r', " ")
        .replace('|', "\\|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> SampleRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn renders_rows_with_summary() {
        let text = format_result_table(
            &columns(&["ProjectID", "ProjectName"]),
            &[
                row(&[("ProjectID", json!(1)), ("ProjectName", json!("UV ink"))]),
                row(&[("ProjectID", json!(2)), ("ProjectName", json!("Clearcoat"))]),
            ],
        );
        assert!(text.contains("| ProjectID | ProjectName |"));
        assert!(text.contains("| 1 | UV ink |"));
        assert!(text.ends_with("Returned 2 row(s)."));
    }

    #[test]
    fn zero_rows_renders_placeholder_row() {
        let text = format_result_table(&columns(&["ProjectID", "ProjectName"]), &[]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "| ProjectID | ProjectName |");
        assert_eq!(lines[1], "| --- | --- |");
        assert_eq!(lines[2], "| (no rows) |  |");
        assert!(text.ends_with("No rows matched the query."));
    }

    #[test]
    fn zero_columns_renders_result_placeholder() {
        let text = format_result_table(&[], &[]);
        assert!(text.starts_with("| result |"));
        assert!(text.contains("| (no columns) |"));
        assert!(text.contains("No structured columns were returned by the query."));
    }

    #[test]
    fn caps_at_twenty_rows() {
        let rows: Vec<SampleRow> = (0..25)
            .map(|i| row(&[("ProjectID", json!(i))]))
            .collect();
        let text = format_result_table(&columns(&["ProjectID"]), &rows);
        assert_eq!(text.lines().filter(|l| l.starts_with("| ")).count() - 2, 20);
        assert!(text.ends_with("Returned 25 rows; showing first 20 rows."));
    }

    #[test]
    fn escapes_pipes_and_newlines() {
        let text = format_result_table(
            &columns(&["Notes"]),
            &[row(&[("Notes", json!("a|b\r\nc\nd"))])],
        );
        assert!(text.contains("| a\\|b c d |"));
    }

    #[test]
    fn null_and_missing_cells_render_as_null() {
        let text = format_result_table(
            &columns(&["ProjectID", "Notes"]),
            &[row(&[("ProjectID", json!(1)), ("Notes", Value::Null)])],
        );
        assert!(text.contains("| 1 | NULL |"));

        let text = format_result_table(
            &columns(&["ProjectID", "Missing"]),
            &[row(&[("ProjectID", json!(1))])],
        );
        assert!(text.contains("| 1 | NULL |"));
    }
}
