//! Subcommand implementations, run against a pool.

use std::time::{Duration, Instant};

use thinwire::{ExecuteStatus, Pool, RowSet, StatementKind, Value};
use tracing::{debug, info};

use crate::Result;

/// Result of running one statement.
#[derive(Debug)]
pub enum Outcome {
    Rows(RowSet),
    Executed(ExecuteStatus),
}

/// Round-trip report for `ping`.
#[derive(Debug, Clone)]
pub struct PingReport {
    pub server_version: Option<String>,
    pub session_id: Option<u32>,
    pub elapsed: Duration,
}

/// Run `sql` with positional `params` on a pooled session.
///
/// With `commit`, a DML or PL/SQL execution is committed before the session
/// goes back to the pool; otherwise the pool rolls it back.
pub fn run_statement(pool: &Pool, sql: &str, params: &[String], commit: bool) -> Result<Outcome> {
    let values: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();
    let session = pool.get()?;
    let kind = StatementKind::classify(sql);
    debug!(%kind, binds = values.len(), "running statement");

    if kind.returns_rows() {
        return Ok(Outcome::Rows(session.query(sql, values)?));
    }

    let status = session.execute_sql(sql, values)?;
    if commit && session.in_transaction() {
        session.commit()?;
        info!(rows = status.rows_affected, "committed");
    }
    Ok(Outcome::Executed(status))
}

/// Check out a session, ping it and report the round trip.
pub fn ping(pool: &Pool) -> Result<PingReport> {
    let session = pool.get()?;
    let started = Instant::now();
    session.ping()?;
    Ok(PingReport {
        server_version: session.server_version().map(str::to_string),
        session_id: session.session_id(),
        elapsed: started.elapsed(),
    })
}

/// Interpret a command-line bind value.
///
/// `null` binds NULL, integers and decimals bind as numbers, text wrapped in
/// single quotes binds as that text verbatim, and anything else binds as a
/// string.
pub fn parse_param(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if raw.len() >= 2
        && let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\''))
    {
        return Value::from(inner);
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Value::from(v);
    }
    if let Ok(v) = raw.parse::<f64>()
        && v.is_finite()
    {
        return Value::from(v);
    }
    Value::from(raw)
}

#[cfg(test)]
mod tests {
    use thinwire::testing::MockServer;
    use thinwire::{PoolConfig, SessionOptions};

    use super::*;

    fn pool(server: &MockServer) -> Pool {
        Pool::new(
            server.descriptor(),
            server.credentials(),
            SessionOptions::default(),
            PoolConfig::default().size(1, 2),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("NULL"), Value::Null);
        assert_eq!(parse_param("42"), Value::Integer(42));
        assert_eq!(parse_param("2.5"), Value::Double(2.5));
        assert_eq!(parse_param("'42'"), Value::from("42"));
        assert_eq!(parse_param("hello"), Value::from("hello"));
        assert_eq!(parse_param("inf"), Value::from("inf"));
        assert_eq!(parse_param("'"), Value::from("'"));
    }

    #[test]
    fn test_query_returns_rows() {
        let server = MockServer::start().unwrap();
        let pool = pool(&server);
        let Outcome::Rows(set) =
            run_statement(&pool, "SELECT :1, :2 FROM DUAL", &["7".into(), "x".into()], false)
                .unwrap()
        else {
            panic!("expected rows");
        };
        assert_eq!(set.rows.len(), 1);
        assert_eq!(set.rows[0].get(0), Some(&Value::Integer(7)));
        assert_eq!(set.rows[0].get(1).and_then(Value::as_str), Some("x"));
    }

    #[test]
    fn test_commit_flag_persists_dml() {
        let server = MockServer::start().unwrap();
        let pool = pool(&server);
        run_statement(&pool, "CREATE TABLE t (id NUMBER)", &[], false).unwrap();

        run_statement(&pool, "INSERT INTO t VALUES (:1)", &["1".into()], false).unwrap();
        let Outcome::Rows(set) = run_statement(&pool, "SELECT * FROM t", &[], false).unwrap()
        else {
            panic!("expected rows");
        };
        assert!(set.rows.is_empty());

        let Outcome::Executed(status) =
            run_statement(&pool, "INSERT INTO t VALUES (:1)", &["2".into()], true).unwrap()
        else {
            panic!("expected status");
        };
        assert_eq!(status.rows_affected, 1);
        let Outcome::Rows(set) = run_statement(&pool, "SELECT * FROM t", &[], false).unwrap()
        else {
            panic!("expected rows");
        };
        assert_eq!(set.rows.len(), 1);
    }

    #[test]
    fn test_server_error_surfaces() {
        let server = MockServer::start().unwrap();
        let pool = pool(&server);
        let err = run_statement(&pool, "SELECT * FROM missing", &[], false).unwrap_err();
        let crate::Error::Database(err) = err else {
            panic!("expected database error");
        };
        assert_eq!(err.server_error().map(thinwire::ServerError::code), Some(942));
    }

    #[test]
    fn test_ping_reports_server() {
        let server = MockServer::start().unwrap();
        let pool = pool(&server);
        let report = ping(&pool).unwrap();
        assert!(report.server_version.is_some());
        assert!(report.session_id.is_some());
    }
}
