//! Toy statement engine behind the mock server.
//!
//! Understands just enough SQL to exercise the client: `SELECT 1 FROM DUAL`,
//! `SELECT SLEEP(ms) FROM DUAL`, `SELECT * FROM SERIES(n)`,
//! `SELECT TO_CLOB('text') FROM DUAL`, bind echo (`SELECT :a, :b FROM DUAL`),
//! `CREATE TABLE`, `INSERT INTO t VALUES (...)`, `SELECT * FROM t` and
//! anonymous `BEGIN ... END` blocks. The first column of every table is a
//! unique key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bigdecimal::BigDecimal;
use num_traits::ToPrimitive;
use parking_lot::Mutex;

use crate::codec::{
    BatchError, BindDescriptor, ColumnInfo, DbType, ExecuteOptions, ExecuteRequest, LobLocator,
    Row, Value,
};
use crate::error::ServerError;

pub(super) const UNIQUE_VIOLATED: u32 = 1;
pub(super) const INVALID_SQL: u32 = 900;
pub(super) const TOO_MANY_VALUES: u32 = 913;
pub(super) const INCONSISTENT_TYPES: u32 = 932;
pub(super) const NO_SUCH_TABLE: u32 = 942;
pub(super) const NOT_ENOUGH_VALUES: u32 = 947;
pub(super) const NAME_IN_USE: u32 = 955;
pub(super) const INVALID_CURSOR: u32 = 1001;
pub(super) const NO_SUCH_LOB: u32 = 22922;

const LOB_CHUNK: u32 = 8;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Plan {
    Dual,
    Sleep(Duration),
    Series(u64),
    Echo,
    Clob(String),
    Scan { table: String, offset: u32 },
    Create { table: String, columns: Vec<ColumnInfo> },
    Insert { table: String, offset: u32 },
    Block,
}

impl Plan {
    pub(super) const fn is_query(&self) -> bool {
        matches!(
            self,
            Self::Dual | Self::Sleep(_) | Self::Series(_) | Self::Echo | Self::Clob(_) | Self::Scan { .. }
        )
    }
}

/// A server error, optionally announced by a break marker first.
#[derive(Debug)]
pub(super) struct Failure {
    pub error: ServerError,
    pub interrupt: bool,
}

impl From<ServerError> for Failure {
    fn from(error: ServerError) -> Self {
        Self {
            error,
            interrupt: false,
        }
    }
}

pub(super) enum Outcome {
    Rows {
        columns: Vec<ColumnInfo>,
        rows: Vec<Row>,
    },
    Affected {
        row_counts: Vec<u64>,
        errors: Vec<BatchError>,
    },
}

/// Uncommitted row of one connection.
#[derive(Debug, Clone)]
pub(super) struct PendingRow {
    table: String,
    values: Vec<Value>,
}

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<ColumnInfo>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
pub(super) struct Database {
    tables: Mutex<HashMap<String, Table>>,
    lobs: Mutex<HashMap<Vec<u8>, String>>,
    next_lob: AtomicU32,
}

fn invalid_sql(sql: &str) -> ServerError {
    ServerError::new(INVALID_SQL, format!("invalid SQL statement: {sql}"))
}

/// Split on commas outside parentheses and quotes.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let (mut depth, mut quoted, mut start) = (0i32, false, 0);
    for (i, c) in list.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => {
                parts.push(list[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(list[start..].trim());
    parts
}

fn between<'a>(text: &'a str, open: &str, close: char) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].rfind(close)? + start;
    Some(&text[start..end])
}

fn column_type(type_text: &str) -> Option<DbType> {
    let name = type_text.split(['(', ' ']).next()?;
    Some(match name {
        "NUMBER" | "DECIMAL" => DbType::Number,
        "INTEGER" | "INT" => DbType::BinaryInteger,
        "VARCHAR2" | "VARCHAR" | "NVARCHAR2" => DbType::Varchar,
        "CHAR" => DbType::Char,
        "RAW" => DbType::Raw,
        "DATE" => DbType::Date,
        "TIMESTAMP" => DbType::Timestamp,
        "BINARY_FLOAT" => DbType::BinaryFloat,
        "BINARY_DOUBLE" => DbType::BinaryDouble,
        "BOOLEAN" => DbType::Boolean,
        "CLOB" => DbType::Clob,
        "BLOB" => DbType::Blob,
        _ => return None,
    })
}

fn offset_of(upper: &str, needle: &str, from: usize) -> u32 {
    upper[from..].find(needle).map_or(0, |i| (i + from) as u32)
}

pub(super) fn parse(sql: &str) -> Result<Plan, ServerError> {
    let upper = sql.to_ascii_uppercase();
    let text = upper.trim().trim_end_matches(';').trim();
    let lead = upper.len() - upper.trim_start().len();

    if text.starts_with("BEGIN") && text.ends_with("END") {
        return Ok(Plan::Block);
    }

    if let Some(rest) = text.strip_prefix("CREATE TABLE ") {
        let table = rest
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| invalid_sql(sql))?;
        let body = between(rest, "(", ')').ok_or_else(|| invalid_sql(sql))?;
        let columns = split_top_level(body)
            .into_iter()
            .map(|def| {
                let (name, type_text) = def.split_once(char::is_whitespace)?;
                Some(ColumnInfo::new(name, column_type(type_text.trim())?))
            })
            .collect::<Option<Vec<_>>>()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| invalid_sql(sql))?;
        return Ok(Plan::Create {
            table: table.to_string(),
            columns,
        });
    }

    if let Some(rest) = text.strip_prefix("INSERT INTO ") {
        let table = rest
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| invalid_sql(sql))?;
        if !rest.contains("VALUES") {
            return Err(invalid_sql(sql));
        }
        return Ok(Plan::Insert {
            table: table.to_string(),
            offset: offset_of(&upper, table, lead + "INSERT INTO ".len()),
        });
    }

    let Some(rest) = text.strip_prefix("SELECT ") else {
        return Err(invalid_sql(sql));
    };
    let Some(from) = rest.rfind(" FROM ") else {
        return Err(invalid_sql(sql));
    };
    let list = rest[..from].trim();
    let source = rest[from + " FROM ".len()..].trim();

    if source == "DUAL" {
        if list == "1" {
            return Ok(Plan::Dual);
        }
        if let Some(ms) = between(list, "SLEEP(", ')') {
            let ms: u64 = ms.trim().parse().map_err(|_| invalid_sql(sql))?;
            return Ok(Plan::Sleep(Duration::from_millis(ms)));
        }
        if list.starts_with("TO_CLOB(") {
            // Literal keeps its case: slice it out of the original text.
            let start = upper.find("TO_CLOB('").ok_or_else(|| invalid_sql(sql))? + "TO_CLOB('".len();
            let end = upper[start..].find('\'').ok_or_else(|| invalid_sql(sql))? + start;
            return Ok(Plan::Clob(sql[start..end].to_string()));
        }
        if split_top_level(list).iter().all(|item| item.starts_with(':')) {
            return Ok(Plan::Echo);
        }
        return Err(invalid_sql(sql));
    }

    if list != "*" {
        return Err(invalid_sql(sql));
    }
    if let Some(n) = between(source, "SERIES(", ')') {
        let n: u64 = n.trim().parse().map_err(|_| invalid_sql(sql))?;
        return Ok(Plan::Series(n));
    }
    if source.split_whitespace().count() == 1 {
        return Ok(Plan::Scan {
            table: source.to_string(),
            offset: upper.rfind(source).map_or(0, |i| i as u32),
        });
    }
    Err(invalid_sql(sql))
}

fn no_such_table(offset: u32) -> Failure {
    Failure {
        error: ServerError::new(NO_SUCH_TABLE, "table or view does not exist").with_offset(offset),
        interrupt: true,
    }
}

fn key(value: &Value) -> String {
    value
        .as_i64()
        .map_or_else(|| format!("{value:?}"), |i| i.to_string())
}

/// Store a bound value under its column's type.
fn coerce(value: Value, column: &ColumnInfo) -> Result<Value, ServerError> {
    let Some(actual) = value.db_type() else {
        return Ok(value);
    };
    if actual == column.db_type {
        return Ok(value);
    }
    let converted = match (value, column.db_type) {
        (Value::Integer(i), DbType::Number) => Some(Value::Number(BigDecimal::from(i))),
        (Value::Number(d), DbType::BinaryInteger) => d.to_i64().map(Value::Integer),
        (Value::Varchar(s), DbType::Char) => Some(Value::Char(s)),
        (Value::Char(s), DbType::Varchar) => Some(Value::Varchar(s)),
        _ => None,
    };
    converted.ok_or_else(|| {
        ServerError::new(
            INCONSISTENT_TYPES,
            format!("inconsistent datatypes: expected {} got {actual}", column.db_type),
        )
    })
}

impl Database {
    pub(super) fn run(
        &self,
        plan: &Plan,
        request: &ExecuteRequest,
        pending: &mut Vec<PendingRow>,
    ) -> Result<Outcome, Failure> {
        match plan {
            Plan::Dual => Ok(Outcome::Rows {
                columns: vec![ColumnInfo::new("1", DbType::Number)],
                rows: vec![Row::new(vec![Value::Number(1.into())])],
            }),
            Plan::Sleep(pause) => {
                std::thread::sleep(*pause);
                Ok(Outcome::Rows {
                    columns: vec![ColumnInfo::new("SLEPT", DbType::BinaryInteger)],
                    rows: vec![Row::new(vec![Value::Integer(pause.as_millis() as i64)])],
                })
            }
            Plan::Series(n) => Ok(Outcome::Rows {
                columns: vec![ColumnInfo::new("N", DbType::Number)],
                rows: (1..=*n)
                    .map(|i| Row::new(vec![Value::Number(i.into())]))
                    .collect(),
            }),
            Plan::Echo => Ok(Outcome::Rows {
                columns: echo_columns(&request.binds),
                rows: request.rows.iter().cloned().map(Row::new).collect(),
            }),
            Plan::Clob(text) => {
                let id = self.next_lob.fetch_add(1, Ordering::Relaxed);
                let locator = format!("lob-{id}").into_bytes();
                let size = text.chars().count() as u64;
                self.lobs.lock().insert(locator.clone(), text.clone());
                Ok(Outcome::Rows {
                    columns: vec![ColumnInfo::new("TO_CLOB", DbType::Clob)],
                    rows: vec![Row::new(vec![Value::Clob(LobLocator {
                        size,
                        chunk_size: LOB_CHUNK,
                        locator,
                    })])],
                })
            }
            Plan::Scan { table, offset } => {
                let tables = self.tables.lock();
                let found = tables.get(table).ok_or_else(|| no_such_table(*offset))?;
                let rows = found
                    .rows
                    .iter()
                    .chain(pending.iter().filter(|p| &p.table == table).map(|p| &p.values))
                    .cloned()
                    .map(Row::new)
                    .collect();
                Ok(Outcome::Rows {
                    columns: found.columns.clone(),
                    rows,
                })
            }
            Plan::Create { table, columns } => {
                let mut tables = self.tables.lock();
                if tables.contains_key(table) {
                    return Err(ServerError::new(
                        NAME_IN_USE,
                        "name is already used by an existing object",
                    )
                    .into());
                }
                tables.insert(
                    table.clone(),
                    Table {
                        columns: columns.clone(),
                        rows: Vec::new(),
                    },
                );
                Ok(Outcome::Affected {
                    row_counts: Vec::new(),
                    errors: Vec::new(),
                })
            }
            Plan::Insert { table, offset } => self.insert(table, *offset, request, pending),
            Plan::Block => Ok(Outcome::Affected {
                row_counts: Vec::new(),
                errors: Vec::new(),
            }),
        }
    }

    fn insert(
        &self,
        table: &str,
        offset: u32,
        request: &ExecuteRequest,
        pending: &mut Vec<PendingRow>,
    ) -> Result<Outcome, Failure> {
        let tables = self.tables.lock();
        let found = tables.get(table).ok_or_else(|| no_such_table(offset))?;
        let width = found.columns.len();
        if request.binds.len() < width {
            return Err(ServerError::new(NOT_ENOUGH_VALUES, "not enough values").into());
        }
        if request.binds.len() > width {
            return Err(ServerError::new(TOO_MANY_VALUES, "too many values").into());
        }

        let mut keys: Vec<String> = found
            .rows
            .iter()
            .chain(pending.iter().filter(|p| p.table == table).map(|p| &p.values))
            .map(|row| key(&row[0]))
            .collect();
        let collect_errors = request.options.contains(ExecuteOptions::BATCH_ERRORS);
        let mut accepted = Vec::new();
        let mut row_counts = Vec::with_capacity(request.rows.len());
        let mut errors = Vec::new();

        for (index, row) in request.rows.iter().enumerate() {
            let result = row
                .iter()
                .cloned()
                .zip(&found.columns)
                .map(|(value, column)| coerce(value, column))
                .collect::<Result<Vec<_>, _>>()
                .and_then(|values| {
                    let row_key = key(&values[0]);
                    if keys.contains(&row_key) {
                        Err(ServerError::new(
                            UNIQUE_VIOLATED,
                            format!("unique constraint ({table}.{}) violated", found.columns[0].name),
                        ))
                    } else {
                        keys.push(row_key);
                        Ok(values)
                    }
                });
            match result {
                Ok(values) => {
                    accepted.push(PendingRow {
                        table: table.to_string(),
                        values,
                    });
                    row_counts.push(1);
                }
                Err(error) if collect_errors => {
                    errors.push(BatchError {
                        index: index as u32,
                        error,
                    });
                    row_counts.push(0);
                }
                Err(error) => return Err(error.into()),
            }
        }
        pending.extend(accepted);
        Ok(Outcome::Affected { row_counts, errors })
    }

    pub(super) fn commit(&self, pending: Vec<PendingRow>) {
        let mut tables = self.tables.lock();
        for row in pending {
            if let Some(table) = tables.get_mut(&row.table) {
                table.rows.push(row.values);
            }
        }
    }

    /// Characters `offset..offset + amount` of a CLOB, as UTF-8.
    pub(super) fn read_lob(&self, locator: &[u8], offset: u64, amount: u64) -> Result<Vec<u8>, ServerError> {
        let lobs = self.lobs.lock();
        let text = lobs
            .get(locator)
            .ok_or_else(|| ServerError::new(NO_SUCH_LOB, "invalid LOB locator specified"))?;
        Ok(text
            .chars()
            .skip(offset as usize)
            .take(amount as usize)
            .collect::<String>()
            .into_bytes())
    }
}

fn echo_columns(binds: &[BindDescriptor]) -> Vec<ColumnInfo> {
    binds
        .iter()
        .enumerate()
        .map(|(i, bind)| ColumnInfo {
            charset_form: bind.charset_form,
            ..ColumnInfo::new(format!(":{}", i + 1), bind.db_type)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plans() {
        assert_eq!(parse("select 1 from dual").unwrap(), Plan::Dual);
        assert_eq!(
            parse("SELECT SLEEP(250) FROM DUAL").unwrap(),
            Plan::Sleep(Duration::from_millis(250))
        );
        assert_eq!(parse("SELECT * FROM SERIES(10)").unwrap(), Plan::Series(10));
        assert_eq!(parse("SELECT :a, :b FROM dual").unwrap(), Plan::Echo);
        assert_eq!(
            parse("SELECT TO_CLOB('Hello, World') FROM DUAL").unwrap(),
            Plan::Clob("Hello, World".into())
        );
        assert_eq!(parse("BEGIN NULL; END;").unwrap(), Plan::Block);
    }

    #[test]
    fn test_parse_create_table() {
        let Plan::Create { table, columns } =
            parse("CREATE TABLE emp (id NUMBER(10, 0), name VARCHAR2(40))").unwrap()
        else {
            panic!("expected a create plan");
        };
        assert_eq!(table, "EMP");
        assert_eq!(columns[0].db_type, DbType::Number);
        assert_eq!(columns[1].name, "NAME");
    }

    #[test]
    fn test_table_offsets() {
        assert_eq!(
            parse("SELECT * FROM missing").unwrap(),
            Plan::Scan {
                table: "MISSING".into(),
                offset: 14
            }
        );
        assert_eq!(
            parse("INSERT INTO t VALUES (:1)").unwrap(),
            Plan::Insert {
                table: "T".into(),
                offset: 12
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_sql() {
        let err = parse("EXPLAIN PLAN FOR x").unwrap_err();
        assert_eq!(err.code(), INVALID_SQL);
    }
}
