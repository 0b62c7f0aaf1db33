//! End-to-end tests against the in-process mock server.

use std::str::FromStr;
use std::thread;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::{FixedOffset, NaiveDate, TimeZone};

use crate::testing::{MockConfig, MockServer};
use crate::{
    AuthMode, BindParams, ConnectDescriptor, Credentials, Pool, PoolConfig, RowStatus, Session,
    SessionOptions, SessionState, StatementKind, Value,
};

fn connect(server: &MockServer) -> Session {
    connect_with(server, SessionOptions::default())
}

fn connect_with(server: &MockServer, options: SessionOptions) -> Session {
    Session::connect(&server.descriptor(), &server.credentials(), &options).unwrap()
}

fn pool(server: &MockServer, config: PoolConfig) -> Pool {
    Pool::new(
        server.descriptor(),
        server.credentials(),
        SessionOptions::default(),
        config,
    )
    .unwrap()
}

fn create_table(session: &Session, sql: &str) {
    let status = session.execute_sql(sql, ()).unwrap();
    assert_eq!(status.kind, StatementKind::Ddl);
}

// ═══════════════════════════════════════════════════════════════════════════
// Session setup
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_connect_and_select_one() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.server_version(), Some("Mock Database 23.4.0"));
    assert!(session.session_id().is_some());
    let info = session.server_info().unwrap();
    assert_eq!(info.sdu, 8192);
    assert_eq!(info.charset, 873);

    let result = session.query("SELECT 1 FROM DUAL", ()).unwrap();
    assert_eq!(result.columns.len(), 1);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get(0).and_then(Value::as_i64), Some(1));

    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    session.close().unwrap();
    assert!(session.ping().unwrap_err().is_closed());
}

#[test]
fn test_plain_auth_mode() {
    let server = MockServer::start().unwrap();
    let credentials = server.credentials().with_auth_mode(AuthMode::Plain);
    let session =
        Session::connect(&server.descriptor(), &credentials, &SessionOptions::default()).unwrap();
    session.ping().unwrap();
}

#[test]
fn test_wrong_password_is_auth_error() {
    let server = MockServer::start().unwrap();
    let credentials = Credentials::new("scott", "lion");
    let err = Session::connect(&server.descriptor(), &credentials, &SessionOptions::default())
        .unwrap_err();
    assert!(err.is_auth());
    assert!(err.to_string().contains("1017"));
}

#[test]
fn test_version_mismatch() {
    let server = MockServer::with_config(MockConfig {
        version_min: 400,
        version_max: 410,
        ..MockConfig::default()
    })
    .unwrap();
    let err = Session::connect(
        &server.descriptor(),
        &server.credentials(),
        &SessionOptions::default(),
    )
    .unwrap_err();
    assert!(err.is_version_mismatch());
}

#[test]
fn test_unknown_service_is_refused() {
    let server = MockServer::start().unwrap();
    let port = server.address().port();
    let descriptor = ConnectDescriptor::new("127.0.0.1", port, "nosuch");
    let err = Session::connect(&descriptor, &server.credentials(), &SessionOptions::default())
        .unwrap_err();
    assert!(err.is_connect());
}

#[test]
fn test_smaller_server_sdu_wins() {
    let server = MockServer::with_config(MockConfig {
        sdu: 1024,
        ..MockConfig::default()
    })
    .unwrap();
    let session = connect(&server);
    assert_eq!(session.server_info().unwrap().sdu, 1024);

    // Larger than one packet in both directions.
    let text = "x".repeat(5000);
    let result = session.query("SELECT :v FROM DUAL", [Value::from(text.as_str())]).unwrap();
    assert_eq!(result.rows[0].get(0).and_then(Value::as_str), Some(text.as_str()));
}

// ═══════════════════════════════════════════════════════════════════════════
// Statements
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_value_types_round_trip() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);

    let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    let values = vec![
        Value::from("héllo"),
        Value::Char("fixed".into()),
        Value::Number(BigDecimal::from_str("-12345.678").unwrap()),
        Value::Integer(-42),
        Value::Float(1.5),
        Value::Double(2.25),
        Value::Raw(vec![0, 1, 0xFE, 0xFF]),
        Value::Date(day.and_hms_opt(13, 45, 10).unwrap()),
        Value::Timestamp(day.and_hms_micro_opt(23, 59, 59, 123_456).unwrap()),
        Value::TimestampTz(
            FixedOffset::east_opt(5 * 3600 + 1800)
                .unwrap()
                .with_ymd_and_hms(2023, 12, 31, 8, 30, 0)
                .unwrap(),
        ),
        Value::Boolean(true),
        Value::Null,
    ];
    let select = (1..=values.len())
        .map(|i| format!(":{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let result = session
        .query(&format!("SELECT {select} FROM DUAL"), values.clone())
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].clone().into_values(), values);
}

#[test]
fn test_named_binds() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    let result = session
        .query(
            "SELECT :b, :a FROM DUAL",
            BindParams::named([("a", Value::from(1)), (":B", Value::from("two"))]),
        )
        .unwrap();
    assert_eq!(
        result.rows[0].clone().into_values(),
        vec![Value::from("two"), Value::from(1)]
    );

    let err = session
        .query("SELECT :a FROM DUAL", BindParams::named([("zzz", 1)]))
        .unwrap_err();
    assert!(err.is_interface());
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn test_prefetch_then_fetch() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);

    let handle = session.prepare("SELECT * FROM SERIES(25)").unwrap();
    session.set_prefetch(handle, 10).unwrap();
    let status = session.execute(handle).unwrap();
    assert_eq!(status.kind, StatementKind::Query);
    assert!(!status.end_of_data);

    let mut seen = Vec::new();
    loop {
        let batch = session.fetch(handle, 10).unwrap();
        assert!(batch.rows.len() <= 10);
        seen.extend(batch.rows.iter().filter_map(|r| r.get(0).and_then(Value::as_i64)));
        if batch.end_of_data {
            break;
        }
    }
    assert_eq!(seen, (1..=25).collect::<Vec<_>>());

    let tail = session.fetch(handle, 10).unwrap();
    assert!(tail.rows.is_empty());
    assert!(tail.end_of_data);
    session.close_cursor(handle).unwrap();
    assert_eq!(session.open_cursors(), 0);
}

#[test]
fn test_no_prefetch_defers_rows() {
    let server = MockServer::start().unwrap();
    let session = connect_with(&server, SessionOptions::default().prefetch_rows(0));
    let handle = session.prepare("SELECT * FROM SERIES(3)").unwrap();
    let status = session.execute(handle).unwrap();
    assert_eq!(status.rows_affected, 0);

    let batch = session.fetch(handle, 100).unwrap();
    assert_eq!(batch.rows.len(), 3);
    assert!(batch.end_of_data);

    let rows = session.query("SELECT * FROM SERIES(7)", ()).unwrap();
    assert_eq!(rows.rows.len(), 7);
}

#[test]
fn test_fetch_misuse_is_interface_error() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    let handle = session.prepare("SELECT 1 FROM DUAL").unwrap();
    assert!(session.fetch(handle, 1).unwrap_err().is_interface());
    session.execute(handle).unwrap();
    assert!(session.fetch(handle, 0).unwrap_err().is_interface());

    session.close_cursor(handle).unwrap();
    assert!(session.execute(handle).unwrap_err().is_interface());
    assert!(session.prepare("  ").unwrap_err().is_interface());

    let other = connect(&server);
    let foreign = other.prepare("SELECT 1 FROM DUAL").unwrap();
    assert!(session.execute(foreign).unwrap_err().is_interface());
}

#[test]
fn test_dml_transactions() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    create_table(&session, "CREATE TABLE emp (id NUMBER, name VARCHAR2(20))");
    assert!(!session.in_transaction());

    let status = session
        .execute_sql("INSERT INTO emp VALUES (:1, :2)", [Value::from(1), Value::from("ann")])
        .unwrap();
    assert_eq!(status.kind, StatementKind::Dml);
    assert_eq!(status.rows_affected, 1);
    assert!(status.row_statuses.is_empty());
    assert!(session.in_transaction());

    session.rollback().unwrap();
    assert!(!session.in_transaction());
    assert!(session.query("SELECT * FROM emp", ()).unwrap().rows.is_empty());

    session
        .execute_sql("INSERT INTO emp VALUES (:1, :2)", [Value::from(2), Value::from("bob")])
        .unwrap();
    let other = connect(&server);
    assert!(other.query("SELECT * FROM emp", ()).unwrap().rows.is_empty());
    session.commit().unwrap();
    let rows = other.query("SELECT * FROM emp", ()).unwrap().rows;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(1).and_then(Value::as_str), Some("bob"));
}

#[test]
fn test_autocommit() {
    let server = MockServer::start().unwrap();
    let session = connect_with(&server, SessionOptions::default().autocommit(true));
    create_table(&session, "CREATE TABLE t (id NUMBER)");
    session
        .execute_sql("INSERT INTO t VALUES (:1)", [Value::from(7)])
        .unwrap();
    assert!(!session.in_transaction());
    assert_eq!(connect(&server).query("SELECT * FROM t", ()).unwrap().rows.len(), 1);
}

#[test]
fn test_batch_reports_each_row() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    create_table(&session, "CREATE TABLE t (id NUMBER, v VARCHAR2(10))");

    let rows: Vec<Vec<Value>> = [1, 2, 1, 3, 4]
        .into_iter()
        .map(|id| vec![Value::from(id), Value::from(format!("row{id}"))])
        .collect();
    let status = session
        .execute_batch("INSERT INTO t VALUES (:1, :2)", rows)
        .unwrap();

    assert_eq!(status.rows_affected, 4);
    assert_eq!(status.row_statuses.len(), 5);
    let failures: Vec<_> = status.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, 2);
    assert_eq!(failures[0].1.code(), 1);
    for index in [0, 1, 3, 4] {
        assert_eq!(
            status.row_statuses[index],
            RowStatus::Success { rows_affected: 1 }
        );
    }
    assert_eq!(session.query("SELECT * FROM t", ()).unwrap().rows.len(), 4);
}

#[test]
fn test_batch_rejects_queries_and_empty_input() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    let handle = session.prepare("SELECT 1 FROM DUAL").unwrap();
    assert!(
        session
            .bind_batch(handle, vec![Vec::<Value>::new()])
            .unwrap_err()
            .is_interface()
    );
    let insert = session.prepare("INSERT INTO t VALUES (:1)").unwrap();
    assert!(
        session
            .bind_batch(insert, Vec::<Vec<Value>>::new())
            .unwrap_err()
            .is_interface()
    );
}

#[test]
fn test_server_error_after_break_keeps_session() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);

    let err = session.query("SELECT * FROM missing", ()).unwrap_err();
    assert!(err.is_statement());
    let server_error = err.server_error().unwrap();
    assert_eq!(server_error.code(), 942);
    assert_eq!(server_error.offset(), Some(14));
    assert_eq!(session.state(), SessionState::Ready);

    let err = session.execute_sql("FROBNICATE everything", ()).unwrap_err();
    assert_eq!(err.server_error().map(|e| e.code()), Some(900));
    assert!(!err.is_fatal());

    assert_eq!(session.query("SELECT 1 FROM DUAL", ()).unwrap().rows.len(), 1);
}

#[test]
fn test_plsql_block() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    let status = session.execute_sql("BEGIN NULL; END;", ()).unwrap();
    assert_eq!(status.kind, StatementKind::Plsql);
}

#[test]
fn test_statement_cache_skips_parse() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);

    session.query("SELECT * FROM SERIES(2)", ()).unwrap();
    assert_eq!(server.parse_count(), 1);
    let again = session.query("SELECT * FROM SERIES(2)", ()).unwrap();
    assert_eq!(again.rows.len(), 2);
    assert_eq!(again.columns[0].name, "N");
    assert_eq!(server.parse_count(), 1);

    let stats = session.cache_statistics();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.len, 1);

    // A different bind type needs a fresh parse of the cached cursor.
    session.query("SELECT :1 FROM DUAL", [Value::from(1)]).unwrap();
    session.query("SELECT :1 FROM DUAL", [Value::from("a")]).unwrap();
    assert_eq!(server.parse_count(), 3);
}

#[test]
fn test_disabled_cache_parses_every_time() {
    let server = MockServer::start().unwrap();
    let session = connect_with(&server, SessionOptions::default().statement_cache_size(0));
    for _ in 0..3 {
        session.query("SELECT 1 FROM DUAL", ()).unwrap();
    }
    assert_eq!(server.parse_count(), 3);
    assert_eq!(session.cache_statistics().capacity, 0);
}

#[test]
fn test_unsent_execute_keeps_queued_closes() {
    let server = MockServer::start().unwrap();
    let session = connect_with(&server, SessionOptions::default().statement_cache_size(1));
    session.query("SELECT 1 FROM DUAL", ()).unwrap();
    // Evicts the first cursor into the close queue.
    session.query("SELECT * FROM SERIES(2)", ()).unwrap();
    assert_eq!(server.open_cursors(), 2);

    let err = session
        .execute_sql("SELECT :1 FROM DUAL", [Value::from("x".repeat(40_000))])
        .unwrap_err();
    assert!(err.is_interface());
    assert_eq!(session.state(), SessionState::Ready);

    // The next execute carries the queued close.
    session.query("SELECT * FROM SERIES(7)", ()).unwrap();
    assert_eq!(server.open_cursors(), 2);
}

#[test]
fn test_read_clob() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    let result = session
        .query("SELECT TO_CLOB('Hello, thin world') FROM DUAL", ())
        .unwrap();
    let locator = result.rows[0].get(0).and_then(Value::as_lob).unwrap().clone();
    assert_eq!(locator.size, 17);

    assert_eq!(session.read_lob(&locator, 0, 5).unwrap(), b"Hello");
    assert_eq!(session.read_lob(&locator, 7, 4).unwrap(), b"thin");
    assert_eq!(session.read_lob_to_end(&locator).unwrap(), b"Hello, thin world");
}

// ═══════════════════════════════════════════════════════════════════════════
// Concurrency and cancellation
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_concurrent_call_is_session_busy() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);

    thread::scope(|scope| {
        let slow = scope.spawn(|| session.query("SELECT SLEEP(400) FROM DUAL", ()));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(session.state(), SessionState::Executing);
        assert!(session.ping().unwrap_err().is_session_busy());
        assert!(session.close().unwrap_err().is_session_busy());
        assert_eq!(slow.join().unwrap().unwrap().rows.len(), 1);
    });
    assert_eq!(session.state(), SessionState::Ready);
    session.ping().unwrap();
}

#[test]
fn test_closer_interrupts_blocked_call() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    let closer = session.closer();

    thread::scope(|scope| {
        let slow = scope.spawn(|| session.query("SELECT SLEEP(5000) FROM DUAL", ()));
        thread::sleep(Duration::from_millis(100));
        closer.close();
        let err = slow.join().unwrap().unwrap_err();
        assert!(err.is_fatal());
    });
    assert_eq!(session.state(), SessionState::Error);
    assert!(session.ping().unwrap_err().is_invalid_state());
    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_network_timeout() {
    let server = MockServer::start().unwrap();
    let options = SessionOptions::default().network_timeout(Some(Duration::from_millis(150)));
    let session = connect_with(&server, options);
    let err = session.query("SELECT SLEEP(1000) FROM DUAL", ()).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(session.state(), SessionState::Error);
}

#[test]
fn test_statistics_count_calls() {
    let server = MockServer::start().unwrap();
    let session = connect(&server);
    let before = session.statistics();
    session.ping().unwrap();
    session.ping().unwrap();
    let after = session.statistics();
    assert_eq!(after.call_count, before.call_count + 2);
    assert!(after.transfer.bytes_sent > before.transfer.bytes_sent);
}

// ═══════════════════════════════════════════════════════════════════════════
// Pool
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_pooled_select_one_returns_session_to_idle() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(1, 1));

    let session = pool.acquire(Duration::from_secs(1)).unwrap();
    let handle = session.prepare("SELECT 1 FROM dual").unwrap();
    session.execute(handle).unwrap();

    let batch = session.fetch(handle, 10).unwrap();
    assert_eq!(batch.rows.len(), 1);
    assert_eq!(batch.rows[0].len(), 1);
    assert_eq!(batch.rows[0].get(0).and_then(Value::as_i64), Some(1));

    let tail = session.fetch(handle, 10).unwrap();
    assert!(tail.rows.is_empty());
    assert!(tail.end_of_data);

    session.close_cursor(handle).unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    pool.release(session);

    let status = pool.status();
    assert_eq!((status.size, status.available, status.in_use), (1, 1, 0));
    let again = pool.acquire(Duration::ZERO).unwrap();
    assert_eq!(again.state(), SessionState::Ready);
}

#[test]
fn test_pool_bounds() {
    let server = MockServer::start().unwrap();
    let pool = pool(
        &server,
        PoolConfig::default()
            .size(1, 2)
            .wait_timeout(Duration::from_millis(150)),
    );
    let status = pool.status();
    assert_eq!((status.size, status.available, status.in_use), (1, 1, 0));

    let a = pool.get().unwrap();
    let b = pool.get().unwrap();
    assert_eq!(pool.status().in_use, 2);
    assert!(pool.acquire(Duration::ZERO).unwrap_err().is_pool_exhausted());
    assert!(pool.get().unwrap_err().is_pool_timeout());

    pool.release(a);
    assert_eq!(pool.status().available, 1);
    let c = pool.get().unwrap();
    c.ping().unwrap();
    drop((b, c));
    assert_eq!(pool.status().size, 2);
    assert_eq!(server.connection_count(), 2);
}

#[test]
fn test_pool_never_exceeds_max() {
    let server = MockServer::start().unwrap();
    let pool = pool(
        &server,
        PoolConfig::default()
            .size(0, 3)
            .increment(2)
            .wait_timeout(Duration::from_secs(10)),
    );
    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..5 {
                    let session = pool.get().unwrap();
                    assert!(pool.status().size <= 3);
                    session.query("SELECT 1 FROM DUAL", ()).unwrap();
                }
            });
        }
    });
    let status = pool.status();
    assert!(status.size <= 3);
    assert_eq!(status.in_use, 0);
    assert!(server.connection_count() <= 3);
}

#[test]
fn test_pool_waiter_is_woken_on_release() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(0, 1));
    let held = pool.get().unwrap();
    thread::scope(|scope| {
        let waiter = scope.spawn(|| pool.acquire(Duration::from_secs(5)).map(|s| s.id()));
        thread::sleep(Duration::from_millis(100));
        let id = held.id();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    });
}

#[test]
fn test_pool_replaces_dead_session() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(1, 2));
    let first = pool.get().unwrap().id();
    server.kill_connections();

    let session = pool.get().unwrap();
    assert_ne!(session.id(), first);
    session.query("SELECT 1 FROM DUAL", ()).unwrap();
    assert_eq!(server.connection_count(), 2);
    assert_eq!(pool.status().size, 1);
}

#[test]
fn test_pool_discards_every_dead_idle_session() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(2, 2));
    assert_eq!(pool.status().available, 2);
    server.kill_connections();

    let session = pool.get().unwrap();
    session.query("SELECT 1 FROM DUAL", ()).unwrap();
    assert_eq!(server.connection_count(), 3);
    assert_eq!(pool.status().size, 1);
}

#[test]
fn test_pool_acquire_without_deadline() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(1, 1));
    let held = pool.acquire(Duration::MAX).unwrap();
    thread::scope(|scope| {
        let waiter = scope.spawn(|| pool.acquire(Duration::MAX).map(|s| s.id()));
        thread::sleep(Duration::from_millis(100));
        let id = held.id();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    });
}

#[test]
fn test_pool_acquire_skips_expired_idle_session() {
    let server = MockServer::start().unwrap();
    let pool = pool(
        &server,
        PoolConfig::default()
            .size(0, 2)
            .max_idle_time(Some(Duration::from_millis(20))),
    );
    let first = pool.get().unwrap().id();
    assert_eq!(pool.status().available, 1);
    thread::sleep(Duration::from_millis(50));

    let session = pool.acquire(Duration::from_secs(1)).unwrap();
    assert_ne!(session.id(), first);
    assert_eq!(server.connection_count(), 2);
    assert_eq!(pool.status().size, 1);
}

#[test]
fn test_pool_release_resets_session() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(1, 1));
    {
        let session = pool.get().unwrap();
        create_table(&session, "CREATE TABLE t (id NUMBER)");
        session
            .execute_sql("INSERT INTO t VALUES (:1)", [Value::from(1)])
            .unwrap();
        session.prepare("SELECT 1 FROM DUAL").unwrap();
        assert!(session.in_transaction());
    }
    let session = pool.get().unwrap();
    assert!(!session.in_transaction());
    assert_eq!(session.open_cursors(), 0);
    assert!(session.query("SELECT * FROM t", ()).unwrap().rows.is_empty());
}

#[test]
fn test_pool_discards_failed_session() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(0, 2));
    {
        let session = pool.get().unwrap();
        session.closer().close();
        assert!(session.ping().is_err());
        assert_eq!(session.state(), SessionState::Error);
    }
    let status = pool.status();
    assert_eq!((status.size, status.available), (0, 0));
}

#[test]
fn test_pool_detach() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(0, 1));
    let session = pool.get().unwrap().detach().unwrap();
    assert_eq!(pool.status().size, 0);
    session.ping().unwrap();
    let _other = pool.get().unwrap();
}

#[test]
fn test_pool_resize_and_close() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(3, 4));
    assert_eq!(pool.status().available, 3);

    pool.resize(1, 1).unwrap();
    let status = pool.status();
    assert_eq!((status.size, status.min_size, status.max_size), (1, 1, 1));
    assert!(pool.resize(2, 1).unwrap_err().is_config());

    pool.resize(2, 3).unwrap();
    assert_eq!(pool.status().available, 2);

    pool.close();
    assert!(pool.get().unwrap_err().is_closed());
    assert_eq!(pool.status().size, 0);
}

#[test]
fn test_pool_rejects_bad_config() {
    let server = MockServer::start().unwrap();
    let err = Pool::new(
        server.descriptor(),
        server.credentials(),
        SessionOptions::default(),
        PoolConfig::default().size(3, 2),
    )
    .unwrap_err();
    assert!(err.is_config());
}

#[test]
fn test_sweep_expires_idle_sessions_down_to_min() {
    let server = MockServer::start().unwrap();
    let pool = pool(
        &server,
        PoolConfig::default()
            .size(1, 3)
            .max_idle_time(Some(Duration::from_millis(20))),
    );
    {
        let _a = pool.get().unwrap();
        let _b = pool.get().unwrap();
    }
    assert_eq!(pool.status().available, 2);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(pool.sweep(), 1);
    let status = pool.status();
    assert_eq!((status.size, status.available), (1, 1));
}

#[test]
fn test_keepalive_restores_minimum() {
    let server = MockServer::start().unwrap();
    let pool = pool(&server, PoolConfig::default().size(1, 1));
    let keepalive = pool.spawn_keepalive(Duration::from_millis(20)).unwrap();
    server.kill_connections();
    thread::sleep(Duration::from_millis(300));
    keepalive.stop();

    assert!(server.connection_count() >= 2);
    assert_eq!(pool.status().available, 1);
    pool.get().unwrap().ping().unwrap();
}
