//! SQL scanning for statement kind and bind placeholders, and bind type
//! inference.

use std::fmt;

use crate::codec::{BindDescriptor, DbType, Value};
use crate::error::{Error, Result};

/// Statement category, decided by the first keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// `SELECT` or `WITH`.
    Query,
    /// `INSERT`, `UPDATE`, `DELETE` or `MERGE`.
    Dml,
    /// `BEGIN`, `DECLARE` or `CALL`.
    Plsql,
    /// Anything else.
    Ddl,
}

impl StatementKind {
    /// Classify `sql` by its first keyword, skipping comments and opening
    /// parentheses.
    #[must_use]
    pub fn classify(sql: &str) -> Self {
        let keyword: String = skip_noise(sql)
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase();
        match keyword.as_str() {
            "SELECT" | "WITH" => Self::Query,
            "INSERT" | "UPDATE" | "DELETE" | "MERGE" => Self::Dml,
            "BEGIN" | "DECLARE" | "CALL" => Self::Plsql,
            _ => Self::Ddl,
        }
    }

    #[must_use]
    pub const fn returns_rows(self) -> bool {
        matches!(self, Self::Query)
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Query => "query",
            Self::Dml => "dml",
            Self::Plsql => "plsql",
            Self::Ddl => "ddl",
        })
    }
}

fn skip_noise(mut sql: &str) -> &str {
    loop {
        let trimmed = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(rest) = trimmed.strip_prefix("--") {
            sql = rest.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(rest) = trimmed.strip_prefix("/*") {
            sql = rest.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return trimmed;
        }
    }
}

const fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '#')
}

/// Distinct bind placeholder names in order of first appearance.
///
/// Placeholders inside string literals, quoted identifiers and comments are
/// ignored. Unquoted names are case-insensitive and returned upper-cased;
/// `:"Name"` keeps its case.
pub(crate) fn placeholder_names(sql: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                // Doubled quotes escape themselves and simply reopen the scan.
                for inner in chars.by_ref() {
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for inner in chars.by_ref() {
                    if previous == '*' && inner == '/' {
                        break;
                    }
                    previous = inner;
                }
            }
            ':' => {
                let name = match chars.peek() {
                    Some('"') => {
                        chars.next();
                        chars.by_ref().take_while(|c| *c != '"').collect::<String>()
                    }
                    Some(next) if is_name_char(*next) => {
                        let mut name = String::new();
                        while let Some(next) = chars.peek().copied().filter(|c| is_name_char(*c)) {
                            name.push(next.to_ascii_uppercase());
                            chars.next();
                        }
                        name
                    }
                    _ => continue,
                };
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
            _ => {}
        }
    }
    names
}

/// Values for one execution: by position or by placeholder name.
#[derive(Debug, Clone, PartialEq)]
pub enum BindParams {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl BindParams {
    /// Named values; names may carry a leading `:` and match placeholders
    /// case-insensitively.
    pub fn named<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Order the values by placeholder position.
    pub(crate) fn resolve(self, names: &[String]) -> Result<Vec<Value>> {
        match self {
            Self::Positional(values) => {
                if values.len() != names.len() {
                    return Err(Error::interface(format!(
                        "statement has {} bind placeholders, {} values given",
                        names.len(),
                        values.len()
                    )));
                }
                Ok(values)
            }
            Self::Named(pairs) => {
                let normalized: Vec<(String, Value)> = pairs
                    .into_iter()
                    .map(|(k, v)| (normalize_name(&k), v))
                    .collect();
                if let Some((unknown, _)) = normalized.iter().find(|(k, _)| !names.contains(k)) {
                    return Err(Error::interface(format!("unknown bind name :{unknown}")));
                }
                names
                    .iter()
                    .map(|name| {
                        normalized
                            .iter()
                            .find(|(k, _)| k == name)
                            .map(|(_, v)| v.clone())
                            .ok_or_else(|| Error::interface(format!("missing value for :{name}")))
                    })
                    .collect()
            }
        }
    }
}

fn normalize_name(name: &str) -> String {
    let name = name.strip_prefix(':').unwrap_or(name);
    match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
        Some(quoted) => quoted.to_string(),
        None => name.to_ascii_uppercase(),
    }
}

impl Default for BindParams {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

impl From<Vec<Value>> for BindParams {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}

impl From<()> for BindParams {
    fn from((): ()) -> Self {
        Self::default()
    }
}

impl<const N: usize> From<[Value; N]> for BindParams {
    fn from(values: [Value; N]) -> Self {
        Self::Positional(values.into())
    }
}

/// Bind descriptors for `width` positions across all rows: the type of the
/// first non-null value, VARCHAR when every value is NULL.
pub(crate) fn infer_descriptors(rows: &[Vec<Value>], width: usize) -> Result<Vec<BindDescriptor>> {
    let mut types: Vec<Option<DbType>> = vec![None; width];
    for (index, row) in rows.iter().enumerate() {
        if row.len() != width {
            return Err(Error::interface(format!(
                "bind row {index} has {} values, expected {width}",
                row.len()
            )));
        }
        for (position, value) in row.iter().enumerate() {
            let Some(actual) = value.db_type() else {
                continue;
            };
            match types[position] {
                None => types[position] = Some(actual),
                Some(expected) if expected == actual => {}
                Some(expected) => {
                    return Err(Error::interface(format!(
                        "bind position {} is {expected} in earlier rows but {actual} in row {index}",
                        position + 1
                    )));
                }
            }
        }
    }
    Ok(types
        .into_iter()
        .map(|t| BindDescriptor::new(t.unwrap_or(DbType::Varchar)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(StatementKind::classify("select 1 from dual"), StatementKind::Query);
        assert_eq!(
            StatementKind::classify("  -- note\n /* x */ WITH t AS (SELECT 1) SELECT * FROM t"),
            StatementKind::Query
        );
        assert_eq!(StatementKind::classify("(SELECT 1 FROM dual)"), StatementKind::Query);
        assert_eq!(StatementKind::classify("Merge INTO t USING s"), StatementKind::Dml);
        assert_eq!(StatementKind::classify("begin null; end;"), StatementKind::Plsql);
        assert_eq!(StatementKind::classify("CREATE TABLE t (x NUMBER)"), StatementKind::Ddl);
        assert_eq!(StatementKind::classify(""), StatementKind::Ddl);
    }

    #[test]
    fn test_placeholder_names() {
        let sql = "SELECT ':skip', \":also\" FROM t -- :comment\n\
                   WHERE a = :id AND b = :Name /* :hidden */ AND c = :ID AND d = :\"Mixed\"";
        assert_eq!(placeholder_names(sql), vec!["ID", "NAME", "Mixed"]);
    }

    #[test]
    fn test_placeholder_names_positional_and_assignment() {
        assert_eq!(
            placeholder_names("INSERT INTO t VALUES (:1, :2)"),
            vec!["1", "2"]
        );
        assert_eq!(placeholder_names("BEGIN :out := 1; x := 2; END;"), vec!["OUT"]);
        assert!(placeholder_names("SELECT 1 FROM dual").is_empty());
    }

    #[test]
    fn test_resolve_named() {
        let names = vec!["ID".to_string(), "NAME".to_string()];
        let values = BindParams::named([(":name", Value::from("x")), ("id", Value::from(1))])
            .resolve(&names)
            .unwrap();
        assert_eq!(values, vec![Value::from(1), Value::from("x")]);

        let missing = BindParams::named([("id", 1)]).resolve(&names).unwrap_err();
        assert!(missing.is_interface());
        assert!(missing.to_string().contains(":NAME"));

        let unknown = BindParams::named([("id", 1), ("name", 2), ("extra", 3)])
            .resolve(&names)
            .unwrap_err();
        assert!(unknown.to_string().contains("EXTRA"));
    }

    #[test]
    fn test_resolve_positional_count() {
        let names = vec!["1".to_string()];
        assert!(BindParams::from(vec![]).resolve(&names).unwrap_err().is_interface());
        assert_eq!(
            BindParams::from([Value::Null]).resolve(&names).unwrap(),
            vec![Value::Null]
        );
    }

    #[test]
    fn test_infer_descriptors() {
        let rows = vec![
            vec![Value::Null, Value::Null, Value::from(1)],
            vec![Value::from("a"), Value::Null, Value::from(2)],
        ];
        let types: Vec<DbType> = infer_descriptors(&rows, 3)
            .unwrap()
            .into_iter()
            .map(|d| d.db_type)
            .collect();
        assert_eq!(types, vec![DbType::Varchar, DbType::Varchar, DbType::BinaryInteger]);
    }

    #[test]
    fn test_infer_descriptors_conflict() {
        let rows = vec![vec![Value::from(1)], vec![Value::from("1")]];
        let err = infer_descriptors(&rows, 1).unwrap_err();
        assert!(err.is_interface());
        assert!(err.to_string().contains("row 1"));
    }
}
