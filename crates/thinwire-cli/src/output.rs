//! Plain-text rendering of results

use std::fmt::Write as _;

use thinwire::{ExecuteStatus, RowSet, RowStatus, StatementKind};

/// Widest a single rendered cell may get before it is cut.
const MAX_CELL_WIDTH: usize = 40;

/// Render rows as an aligned table followed by a row count.
pub fn render_rows(set: &RowSet) -> String {
    let headers: Vec<String> = set.columns.iter().map(|c| c.name.clone()).collect();
    let cells: Vec<Vec<String>> = set
        .rows
        .iter()
        .map(|row| row.iter().map(|v| truncate(&v.to_string())).collect())
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let mut out = String::new();
    push_line(&mut out, &headers, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_line(&mut out, &rule, &widths);
    for row in &cells {
        push_line(&mut out, row, &widths);
    }
    let n = set.rows.len();
    let _ = writeln!(out, "\n{n} row{} selected.", plural(n));
    out
}

/// Summarise a non-query execution.
pub fn render_status(status: &ExecuteStatus) -> String {
    let mut out = match status.kind {
        StatementKind::Dml => {
            let n = status.rows_affected;
            format!("{n} row{} affected.\n", plural(n as usize))
        }
        StatementKind::Plsql => "Block completed.\n".to_string(),
        StatementKind::Ddl => "Statement executed.\n".to_string(),
        StatementKind::Query => format!("{} rows fetched.\n", status.rows_affected),
    };
    for (index, status) in status.row_statuses.iter().enumerate() {
        if let RowStatus::Failed(err) = status {
            let _ = writeln!(out, "  row {index}: {err}");
        }
    }
    out
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_CELL_WIDTH {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_CELL_WIDTH - 3).collect();
    cut.push_str("...");
    cut
}

const fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

#[cfg(test)]
mod tests {
    use thinwire::{ColumnInfo, DbType, Row, Value};

    use super::*;

    #[test]
    fn test_render_rows_aligns_columns() {
        let set = RowSet {
            columns: vec![
                ColumnInfo::new("ID", DbType::Number),
                ColumnInfo::new("NAME", DbType::Varchar),
            ],
            rows: vec![
                Row::new(vec![Value::from(1), Value::from("ann")]),
                Row::new(vec![Value::from(1234), Value::Null]),
            ],
        };
        let text = render_rows(&set);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID    NAME");
        assert_eq!(lines[1], "----  ----");
        assert_eq!(lines[2], "1     ann");
        assert_eq!(lines[3], "1234  NULL");
        assert!(text.ends_with("2 rows selected.\n"));
    }

    #[test]
    fn test_render_rows_empty() {
        let set = RowSet {
            columns: vec![ColumnInfo::new("X", DbType::Number)],
            rows: Vec::new(),
        };
        assert!(render_rows(&set).ends_with("0 rows selected.\n"));
    }

    #[test]
    fn test_long_cells_are_cut() {
        let long = "x".repeat(100);
        let cut = truncate(&long);
        assert_eq!(cut.chars().count(), MAX_CELL_WIDTH);
        assert!(cut.ends_with("..."));
    }
}
